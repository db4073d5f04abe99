use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{RenderError, RenderResult};
use crate::worker::WorkerId;

pub type SubtaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskStatus {
    Starting,
    Finished,
    Failure,
    Resent,
}

/// Rango de chunks `[start_chunk, end_chunk)` entregado a un worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub id: SubtaskId,
    pub start_chunk: u32,
    pub end_chunk: u32,
    pub status: SubtaskStatus,
    pub worker_id: WorkerId,
    /// Rendimiento declarado al momento de la asignación
    pub perf_index: f64,
    pub created_at: DateTime<Utc>,
}

impl SubtaskRecord {
    pub fn len(&self) -> u32 {
        self.end_chunk.saturating_sub(self.start_chunk)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registro de todas las subtareas emitidas y su estado.
///
/// Mantiene además `failed_count`: cuántos registros están en `Failure` ahora
/// mismo. Sólo el scheduler inserta; sólo el agregador cambia estados.
#[derive(Debug, Default, Clone)]
pub struct SubtaskLedger {
    records: HashMap<SubtaskId, SubtaskRecord>,
    failed_count: u32,
}

impl SubtaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        start_chunk: u32,
        end_chunk: u32,
        worker_id: &str,
        perf_index: f64,
    ) -> SubtaskId {
        let id = uuid::Uuid::new_v4().to_string();
        self.records.insert(
            id.clone(),
            SubtaskRecord {
                id: id.clone(),
                start_chunk,
                end_chunk,
                status: SubtaskStatus::Starting,
                worker_id: worker_id.to_string(),
                perf_index,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> RenderResult<&SubtaskRecord> {
        self.records
            .get(id)
            .ok_or_else(|| RenderError::UnknownSubtask(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn mark_finished(&mut self, id: &str) -> RenderResult<SubtaskStatus> {
        self.set_status(id, SubtaskStatus::Finished)
    }

    pub fn mark_failure(&mut self, id: &str) -> RenderResult<SubtaskStatus> {
        self.set_status(id, SubtaskStatus::Failure)
    }

    /// Sólo vale desde `Failure`; descuenta `failed_count`.
    pub fn mark_resent(&mut self, id: &str) -> RenderResult<SubtaskStatus> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RenderError::UnknownSubtask(id.to_string()))?;

        if record.status != SubtaskStatus::Failure {
            return Err(RenderError::InvalidTransition {
                id: id.to_string(),
                from: record.status,
                to: SubtaskStatus::Resent,
            });
        }

        record.status = SubtaskStatus::Resent;
        self.failed_count = self.failed_count.saturating_sub(1);
        Ok(SubtaskStatus::Failure)
    }

    /// Cambia el estado y devuelve el anterior, manteniendo `failed_count`.
    fn set_status(&mut self, id: &str, to: SubtaskStatus) -> RenderResult<SubtaskStatus> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RenderError::UnknownSubtask(id.to_string()))?;

        let from = record.status;
        record.status = to;

        match (from == SubtaskStatus::Failure, to == SubtaskStatus::Failure) {
            (false, true) => self.failed_count += 1,
            (true, false) => self.failed_count = self.failed_count.saturating_sub(1),
            _ => {}
        }
        Ok(from)
    }

    /// Algún registro en `Failure`, sin orden definido.
    pub fn find_failed(&self) -> Option<&SubtaskRecord> {
        self.records
            .values()
            .find(|r| r.status == SubtaskStatus::Failure)
    }

    /// Ids de los registros de un worker que todavía están en vuelo.
    pub fn in_flight_for(&self, worker_id: &str) -> Vec<SubtaskId> {
        self.records
            .values()
            .filter(|r| r.worker_id == worker_id && r.status == SubtaskStatus::Starting)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.failed_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_deja_el_registro_en_starting() {
        let mut ledger = SubtaskLedger::new();
        let id = ledger.create(2, 4, "w1", 3000.0);

        let rec = ledger.get(&id).unwrap();
        assert_eq!(rec.status, SubtaskStatus::Starting);
        assert_eq!((rec.start_chunk, rec.end_chunk), (2, 4));
        assert_eq!(rec.worker_id, "w1");
        assert_eq!(rec.len(), 2);
    }

    #[test]
    fn ids_distintos_por_registro() {
        let mut ledger = SubtaskLedger::new();
        let a = ledger.create(0, 1, "w", 1.0);
        let b = ledger.create(0, 1, "w", 1.0);
        assert_ne!(a, b);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn failure_y_resent_mantienen_el_contador() {
        let mut ledger = SubtaskLedger::new();
        let id = ledger.create(0, 2, "w", 1.0);

        ledger.mark_failure(&id).unwrap();
        assert_eq!(ledger.failed_count(), 1);

        // marcar dos veces no cuenta doble
        ledger.mark_failure(&id).unwrap();
        assert_eq!(ledger.failed_count(), 1);

        ledger.mark_resent(&id).unwrap();
        assert_eq!(ledger.failed_count(), 0);
        assert_eq!(ledger.get(&id).unwrap().status, SubtaskStatus::Resent);
    }

    #[test]
    fn resent_solo_desde_failure() {
        let mut ledger = SubtaskLedger::new();
        let id = ledger.create(0, 2, "w", 1.0);

        let err = ledger.mark_resent(&id).unwrap_err();
        assert!(matches!(err, RenderError::InvalidTransition { .. }));
        assert_eq!(ledger.get(&id).unwrap().status, SubtaskStatus::Starting);
    }

    #[test]
    fn finished_desde_failure_descuenta() {
        let mut ledger = SubtaskLedger::new();
        let id = ledger.create(0, 2, "w", 1.0);
        ledger.mark_failure(&id).unwrap();

        let prev = ledger.mark_finished(&id).unwrap();
        assert_eq!(prev, SubtaskStatus::Failure);
        assert_eq!(ledger.failed_count(), 0);
    }

    #[test]
    fn id_desconocido_no_muta_nada() {
        let mut ledger = SubtaskLedger::new();
        ledger.create(0, 1, "w", 1.0);

        assert!(matches!(ledger.get("nope"), Err(RenderError::UnknownSubtask(_))));
        assert!(ledger.mark_finished("nope").is_err());
        assert!(ledger.mark_failure("nope").is_err());
        assert!(ledger.mark_resent("nope").is_err());
        assert_eq!(ledger.failed_count(), 0);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn in_flight_for_filtra_por_worker_y_estado() {
        let mut ledger = SubtaskLedger::new();
        let a = ledger.create(0, 1, "w1", 1.0);
        let b = ledger.create(1, 2, "w1", 1.0);
        ledger.create(2, 3, "w2", 1.0);
        ledger.mark_finished(&b).unwrap();

        assert_eq!(ledger.in_flight_for("w1"), vec![a]);
    }
}
