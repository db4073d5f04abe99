//! Colaboradores concretos del master: todo pasa por el sistema de archivos
//! compartido con los workers.

use anyhow::Context;
use common::{
    chunk_from_file_name, ImageAssembler, OutputFormat, SceneTemplater, SubtaskRecord,
    TileHandle, TileLoader, WorkerAdmission,
};
use serde::Serialize;
use std::{
    collections::HashSet,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Rechaza a los workers listados en BANNED_WORKERS.
pub struct BanList {
    banned: HashSet<String>,
}

impl BanList {
    pub fn new(banned: HashSet<String>) -> Self {
        Self { banned }
    }
}

impl WorkerAdmission for BanList {
    fn admit(&self, worker_id: &str) -> bool {
        !self.banned.contains(worker_id)
    }
}

/// Los tiles son archivos `<basename><N>.<ext>` escritos por el worker.
pub struct FsTileLoader {
    basename: String,
}

impl FsTileLoader {
    pub fn new(basename: &str) -> Self {
        Self {
            basename: basename.to_string(),
        }
    }
}

impl TileLoader for FsTileLoader {
    fn load_result_tiles(&self, payload: &[String]) -> Vec<TileHandle> {
        payload
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(TileHandle::new)
            .collect()
    }

    /// El archivo existe, no está vacío y su número cae dentro del rango.
    fn verify_tile(&self, record: &SubtaskRecord, tile: &TileHandle) -> bool {
        match fs::metadata(tile.path()) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            _ => {
                debug!("tile {} inexistente o vacío", tile.path().display());
                return false;
            }
        }

        let chunk = chunk_from_file_name(&tile.file_name(), &self.basename).unwrap_or_else(|e| {
            warn!("{}; se usa el chunk inicial {}", e, record.start_chunk);
            record.start_chunk
        });
        (record.start_chunk..record.end_chunk).contains(&chunk)
    }
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    output: &'a Path,
    format: OutputFormat,
    /// Cómo combinar los tiles: "add" suma los parciales
    mode: &'static str,
    tiles: Vec<&'a Path>,
}

/// Deja un manifiesto JSON junto a la salida para el compositor externo.
pub struct ManifestAssembler;

impl ManifestAssembler {
    fn write_manifest(&self, target: &Path, manifest: &Manifest<'_>) -> anyhow::Result<PathBuf> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creando {}", parent.display()))?;
            }
        }

        let manifest_path = PathBuf::from(format!("{}.json", target.display()));
        let file = File::create(&manifest_path)
            .with_context(|| format!("creando {}", manifest_path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), manifest)?;

        info!(
            "manifiesto con {} tiles escrito en {}",
            manifest.tiles.len(),
            manifest_path.display()
        );
        Ok(manifest_path)
    }
}

impl ImageAssembler for ManifestAssembler {
    fn merge_tiles(
        &self,
        tiles: &[TileHandle],
        output: &Path,
        format: OutputFormat,
    ) -> anyhow::Result<PathBuf> {
        let target = output.with_extension(format.extension());
        let manifest = Manifest {
            output: &target,
            format,
            mode: "composite",
            tiles: tiles.iter().map(|t| t.path()).collect(),
        };
        self.write_manifest(&target, &manifest)?;
        Ok(target)
    }

    fn assemble_tiles_native(&self, tiles: &[TileHandle], output: &Path) -> anyhow::Result<()> {
        let target = output.with_extension(OutputFormat::Exr.extension());
        let manifest = Manifest {
            output: &target,
            format: OutputFormat::Exr,
            mode: "add",
            tiles: tiles.iter().map(|t| t.path()).collect(),
        };
        self.write_manifest(&target, &manifest)?;
        Ok(())
    }

    fn update_preview(&self, tile: Option<&TileHandle>) {
        if let Some(t) = tile {
            debug!("preview: nuevo tile {}", t.path().display());
        }
    }
}

/// Reescribe Film, PixelFilter y Sampler de una escena pbrt.
///
/// Las directivas nuevas van justo antes de `WorldBegin` (o al principio si
/// no hay). Sólo reconoce directivas de una línea.
pub struct PbrtTemplater;

const REPLACED_DIRECTIVES: [&str; 3] = ["Film", "PixelFilter", "Sampler"];

impl SceneTemplater for PbrtTemplater {
    fn template_scene(
        &self,
        src: &str,
        width: u32,
        height: u32,
        pixel_filter: &str,
        sampler: &str,
        samples_per_pixel: u32,
    ) -> String {
        let header = format!(
            "Film \"image\" \"integer xresolution\" [{width}] \"integer yresolution\" [{height}]\n\
             PixelFilter \"{pixel_filter}\"\n\
             Sampler \"{sampler}\" \"integer pixelsamples\" [{samples_per_pixel}]\n"
        );

        let mut out = String::with_capacity(src.len() + header.len());
        let mut inserted = false;

        for line in src.lines() {
            let trimmed = line.trim_start();
            if REPLACED_DIRECTIVES.iter().any(|d| trimmed.starts_with(d)) {
                continue;
            }
            if !inserted && trimmed.starts_with("WorldBegin") {
                out.push_str(&header);
                inserted = true;
            }
            out.push_str(line);
            out.push('\n');
        }

        if !inserted {
            out.insert_str(0, &header);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::SubtaskStatus;
    use std::{env, io::Write};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("master_collab_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn record(start: u32, end: u32) -> SubtaskRecord {
        SubtaskRecord {
            id: "s1".to_string(),
            start_chunk: start,
            end_chunk: end,
            status: SubtaskStatus::Starting,
            worker_id: "w1".to_string(),
            perf_index: 1500.0,
            created_at: Utc::now(),
        }
    }

    fn write_file(path: &Path, body: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(body).unwrap();
    }

    #[test]
    fn ban_list_rechaza_listados() {
        let bans = BanList::new(["malo".to_string()].into_iter().collect());
        assert!(!bans.admit("malo"));
        assert!(bans.admit("bueno"));
    }

    #[test]
    fn verify_tile_chequea_archivo_y_rango() {
        let tmp = temp_dir("verify");
        let ok = tmp.join("temp3.exr");
        let empty = tmp.join("temp4.exr");
        let outside = tmp.join("temp9.exr");
        let odd_name = tmp.join("render.exr");
        write_file(&ok, b"data");
        write_file(&empty, b"");
        write_file(&outside, b"data");
        write_file(&odd_name, b"data");

        let loader = FsTileLoader::new("temp");
        let rec = record(2, 5);

        assert!(loader.verify_tile(&rec, &TileHandle::new(&ok)));
        assert!(!loader.verify_tile(&rec, &TileHandle::new(&empty)));
        assert!(!loader.verify_tile(&rec, &TileHandle::new(&outside)));
        assert!(!loader.verify_tile(&rec, &TileHandle::new(tmp.join("temp2.exr"))));
        // nombre ilegible: se asume el chunk inicial
        assert!(loader.verify_tile(&rec, &TileHandle::new(&odd_name)));
    }

    #[test]
    fn load_result_tiles_descarta_vacios() {
        let loader = FsTileLoader::new("temp");
        let tiles = loader.load_result_tiles(&["/a/temp0.exr".to_string(), " ".to_string()]);
        assert_eq!(tiles, vec![TileHandle::new("/a/temp0.exr")]);
    }

    #[test]
    fn merge_tiles_escribe_manifiesto() {
        let tmp = temp_dir("merge");
        let output = tmp.join("out").join("final");
        let tiles = vec![TileHandle::new("/t/temp0.exr"), TileHandle::new("/t/temp1.exr")];

        let path = ManifestAssembler
            .merge_tiles(&tiles, &output, OutputFormat::Png)
            .unwrap();
        assert_eq!(path, tmp.join("out").join("final.png"));

        let manifest = fs::read_to_string(tmp.join("out").join("final.png.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(v["format"], "PNG");
        assert_eq!(v["tiles"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn assemble_native_usa_modo_add() {
        let tmp = temp_dir("native");
        let output = tmp.join("final");
        ManifestAssembler
            .assemble_tiles_native(&[TileHandle::new("/t/temp0.exr")], &output)
            .unwrap();

        let manifest = fs::read_to_string(tmp.join("final.exr.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(v["mode"], "add");
        assert_eq!(v["format"], "EXR");
    }

    #[test]
    fn pbrt_templater_reemplaza_directivas() {
        let src = "LookAt 0 0 0  0 0 1  0 1 0\n\
                   Film \"image\" \"integer xresolution\" [10]\n\
                   Sampler \"random\"\n\
                   WorldBegin\n\
                   Shape \"sphere\"\n\
                   WorldEnd\n";

        let out = PbrtTemplater.template_scene(src, 300, 200, "box", "halton", 8);

        assert!(out.starts_with("LookAt"));
        assert!(out.contains("\"integer xresolution\" [300] \"integer yresolution\" [200]"));
        assert!(out.contains("PixelFilter \"box\""));
        assert!(out.contains("Sampler \"halton\" \"integer pixelsamples\" [8]"));
        assert!(!out.contains("[10]"));
        assert!(!out.contains("\"random\""));
        let film = out.find("Film").unwrap();
        let world = out.find("WorldBegin").unwrap();
        assert!(film < world);
        assert_eq!(out.matches("Film").count(), 1);
    }

    #[test]
    fn pbrt_templater_escena_vacia() {
        let out = PbrtTemplater.template_scene("", 1, 1, "mitchell", "lowdiscrepancy", 32);
        assert!(out.starts_with("Film"));
        assert_eq!(out.lines().count(), 3);
    }
}
