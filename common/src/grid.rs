use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Reparto de la imagen en `nx * ny` tiles finos.
///
/// El ancho y alto de cada tile son reales: quien necesite píxeles enteros
/// tiene que redondear con las mismas reglas en el master y en el worker
/// (x redondeado, y truncado hacia abajo para las áreas; ambos redondeados
/// para el borde de preview).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridPartition {
    pub nx: u32,
    pub ny: u32,
    pub tile_width: f64,
    pub tile_height: f64,
}

/// Caja en píxeles `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl GridPartition {
    /// Columna y fila del tile fino `num` (orden por filas).
    pub fn tile_coords(&self, num: u32) -> (u32, u32) {
        (num % self.nx, num / self.nx)
    }

    /// Caja usada para verificar y pintar áreas: x redondeado, y hacia abajo.
    pub fn area_box(&self, num: u32) -> PixelBox {
        let (tx, ty) = self.tile_coords(num);
        PixelBox {
            x0: (tx as f64 * self.tile_width).round() as u32,
            x1: ((tx + 1) as f64 * self.tile_width).round() as u32,
            y0: (ty as f64 * self.tile_height).floor() as u32,
            y1: ((ty + 1) as f64 * self.tile_height).floor() as u32,
        }
    }

    /// Caja usada para el borde de preview: todo redondeado.
    fn outline_box(&self, num: u32) -> PixelBox {
        let (tx, ty) = self.tile_coords(num);
        PixelBox {
            x0: (tx as f64 * self.tile_width).round() as u32,
            x1: ((tx + 1) as f64 * self.tile_width).round() as u32,
            y0: (ty as f64 * self.tile_height).round() as u32,
            y1: ((ty + 1) as f64 * self.tile_height).round() as u32,
        }
    }
}

/// Calcula la grilla casi cuadrada para `total_fine_units` tiles.
///
/// Parte de una sola fila y, mientras `nx` sea par y haya más columnas de las
/// que justifica la relación de aspecto, pasa la mitad de las columnas a filas.
/// Un total de 0 se trata como 1.
pub fn compute_grid(total_fine_units: u32, res_x: u32, res_y: u32) -> GridPartition {
    let mut nx = u64::from(total_fine_units.max(1));
    let mut ny: u64 = 1;
    let (rx, ry) = (u64::from(res_x), u64::from(res_y));

    while nx % 2 == 0 && 2 * rx * ny < ry * nx {
        nx /= 2;
        ny *= 2;
    }

    GridPartition {
        nx: nx as u32,
        ny: ny as u32,
        tile_width: res_x as f64 / nx as f64,
        tile_height: res_y as f64 / ny as f64,
    }
}

/// Chunk grueso (1-based) que contiene el píxel `(x, y)`.
///
/// La grilla se calcula sobre `total_fine_units`; el índice fino se divide por
/// `subtasks_per_chunk` para llegar al chunk.
pub fn pixel_to_chunk(
    x: f64,
    y: f64,
    total_fine_units: u32,
    res_x: u32,
    res_y: u32,
    subtasks_per_chunk: u32,
) -> u32 {
    let grid = compute_grid(total_fine_units, res_x, res_y);
    let col = (x / grid.tile_width).floor() as u32;
    let row = (y / grid.tile_height).floor() as u32;
    let fine = row * grid.nx + col;
    fine / subtasks_per_chunk.max(1) + 1
}

/// Contorno exterior de la unión de los tiles de los chunks `[start, end)`.
///
/// Los bordes horizontales compartidos entre dos tiles seleccionados se
/// cancelan con un toggle sobre el set. El borde izquierdo se emite al abrir
/// cada corrida (primer tile y cada tile pegado a x = 0); el derecho cuando
/// `x1 == res_y` y, al final, el del último tile.
pub fn tile_boundary(
    start_chunk: u32,
    end_chunk: u32,
    total_chunks: u32,
    res_x: u32,
    res_y: u32,
    subtasks_per_chunk: u32,
) -> Vec<(u32, u32)> {
    let subtasks = subtasks_per_chunk.max(1);
    let grid = compute_grid(total_chunks * subtasks, res_x, res_y);

    let mut border: HashSet<(u32, u32)> = HashSet::new();
    let mut new_left = true;
    let mut last_right: Option<(u32, u32, u32)> = None;

    for chunk in start_chunk..end_chunk {
        for sb in 0..subtasks {
            let b = grid.outline_box(subtasks * chunk + sb);

            for i in b.x0..b.x1 {
                if !border.remove(&(i, b.y0)) {
                    border.insert((i, b.y0));
                }
                border.insert((i, b.y1));
            }

            if b.x0 == 0 {
                new_left = true;
            }
            if new_left {
                border.extend((b.y0..b.y1).map(|j| (b.x0, j)));
                new_left = false;
            }

            // el borde derecho se compara contra res_y, no res_x
            if b.x1 == res_y {
                border.extend((b.y0..b.y1).map(|j| (b.x1, j)));
            }
            last_right = Some((b.x1, b.y0, b.y1));
        }
    }

    if let Some((x1, y0, y1)) = last_right {
        border.extend((y0..y1).map(|j| (x1, j)));
    }

    let mut out: Vec<(u32, u32)> = border.into_iter().collect();
    out.sort_unstable();
    out
}

/// Todos los píxeles cubiertos por los chunks `[start, end)`.
pub fn chunk_area_pixels(
    start_chunk: u32,
    end_chunk: u32,
    subtasks_per_chunk: u32,
    grid: &GridPartition,
) -> Vec<(u32, u32)> {
    let subtasks = subtasks_per_chunk.max(1);
    let mut pixels = Vec::new();
    for chunk in start_chunk..end_chunk {
        for sb in 0..subtasks {
            let b = grid.area_box(subtasks * chunk + sb);
            for i in b.x0..b.x1 {
                for j in b.y0..b.y1 {
                    pixels.push((i, j));
                }
            }
        }
    }
    pixels
}
