//! Núcleo del render distribuido por tiles: grilla, registro de subtareas,
//! asignación adaptativa, agregación de resultados y precio.

pub mod aggregator;
pub mod collab;
pub mod error;
pub mod grid;
pub mod job;
pub mod pricing;
pub mod render_job;
pub mod scheduler;
pub mod subtask;
pub mod worker;

pub use aggregator::{chunk_from_file_name, Delivery};
pub use collab::{
    AdmitAll, Collaborators, ImageAssembler, SceneTemplater, TileHandle, TileLoader,
    WorkerAdmission,
};
pub use error::{RenderError, RenderResult};
pub use grid::{compute_grid, pixel_to_chunk, tile_boundary, GridPartition, PixelBox};
pub use job::*;
pub use render_job::RenderJob;
pub use scheduler::ChunkAssignment;
pub use subtask::{SubtaskId, SubtaskLedger, SubtaskRecord, SubtaskStatus};
pub use worker::*;
