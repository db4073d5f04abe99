use crate::subtask::{SubtaskId, SubtaskStatus};

/// Errores del núcleo de render distribuido.
///
/// Ninguno es fatal para el job: quien los recibe los loguea y sigue con un
/// valor por defecto, un reintento o un no-op.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("subtarea desconocida: {0}")]
    UnknownSubtask(SubtaskId),

    #[error("verificación fallida para la subtarea {subtask_id}: {reason}")]
    VerificationFailure { subtask_id: SubtaskId, reason: String },

    #[error("worker {0} no admitido para este job")]
    AdmissionDenied(String),

    #[error("nombre de resultado inválido {name}: {reason}")]
    MalformedResultName { name: String, reason: String },

    #[error("no se pudo leer la escena {path}: {source}")]
    SceneLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transición inválida de la subtarea {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: SubtaskId,
        from: SubtaskStatus,
        to: SubtaskStatus,
    },
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;
