//! Marching-squares contour tracing with chunked emission.
//!
//! Each level is traced independently over the grid; crossing segments are
//! interpolated linearly along cell edges and accumulated into a vertex
//! buffer plus polyline start offsets. Whenever the buffer reaches the
//! chunk size it is handed to the callback, so a slow client starts
//! receiving contours long before the trace finishes.
//!
//! Output coordinates are `(v + offset) * scale`: `scale` undoes a prior
//! block-average downsample and `offset` re-centers data that lost a
//! Gaussian halo.

/// Receives finished contour chunks: `(level, vertices, start_indices,
/// progress)`. Vertices are interleaved x/y pairs; start offsets index
/// into the vertex float buffer.
pub type ContourCallback<'a> = &'a mut dyn FnMut(f64, &[f32], &[i32], f64);

#[derive(Clone, Copy)]
enum Edge {
    Bottom,
    Right,
    Top,
    Left,
}

/// Traces every level over the grid, invoking `callback` per filled chunk.
///
/// Cells touching a NaN corner are skipped. `chunk_size` is the vertex
/// count per emitted chunk.
#[allow(clippy::too_many_arguments)]
pub fn trace_contours(
    src: &[f32],
    width: usize,
    height: usize,
    scale: f64,
    offset_x: f64,
    offset_y: f64,
    levels: &[f64],
    chunk_size: usize,
    callback: ContourCallback<'_>,
) {
    if width < 2 || height < 2 || levels.is_empty() {
        return;
    }
    let chunk_floats = chunk_size.max(2) * 2;
    let start = std::time::Instant::now();

    for (level_idx, &level) in levels.iter().enumerate() {
        let mut vertices: Vec<f32> = Vec::with_capacity(chunk_floats);
        let mut indices: Vec<i32> = Vec::new();

        for y in 0..height - 1 {
            for x in 0..width - 1 {
                let v00 = src[y * width + x];
                let v10 = src[y * width + x + 1];
                let v01 = src[(y + 1) * width + x];
                let v11 = src[(y + 1) * width + x + 1];
                if v00.is_nan() || v10.is_nan() || v01.is_nan() || v11.is_nan() {
                    continue;
                }

                let mut case = 0u8;
                if v00 as f64 >= level {
                    case |= 1;
                }
                if v10 as f64 >= level {
                    case |= 2;
                }
                if v11 as f64 >= level {
                    case |= 4;
                }
                if v01 as f64 >= level {
                    case |= 8;
                }

                let segments: &[(Edge, Edge)] = match case {
                    1 => &[(Edge::Left, Edge::Bottom)],
                    2 => &[(Edge::Bottom, Edge::Right)],
                    3 => &[(Edge::Left, Edge::Right)],
                    4 => &[(Edge::Right, Edge::Top)],
                    5 => {
                        let center = 0.25 * (v00 + v10 + v01 + v11) as f64;
                        if center >= level {
                            &[(Edge::Left, Edge::Top), (Edge::Bottom, Edge::Right)]
                        } else {
                            &[(Edge::Left, Edge::Bottom), (Edge::Right, Edge::Top)]
                        }
                    }
                    6 => &[(Edge::Bottom, Edge::Top)],
                    7 => &[(Edge::Left, Edge::Top)],
                    8 => &[(Edge::Top, Edge::Left)],
                    9 => &[(Edge::Bottom, Edge::Top)],
                    10 => {
                        let center = 0.25 * (v00 + v10 + v01 + v11) as f64;
                        if center >= level {
                            &[(Edge::Bottom, Edge::Left), (Edge::Top, Edge::Right)]
                        } else {
                            &[(Edge::Bottom, Edge::Right), (Edge::Top, Edge::Left)]
                        }
                    }
                    11 => &[(Edge::Right, Edge::Top)],
                    12 => &[(Edge::Left, Edge::Right)],
                    13 => &[(Edge::Bottom, Edge::Right)],
                    14 => &[(Edge::Left, Edge::Bottom)],
                    _ => &[],
                };

                for &(a, b) in segments {
                    let (ax, ay) = edge_point(a, x, y, v00, v10, v01, v11, level);
                    let (bx, by) = edge_point(b, x, y, v00, v10, v01, v11, level);
                    indices.push(vertices.len() as i32);
                    vertices.push(((ax + offset_x) * scale) as f32);
                    vertices.push(((ay + offset_y) * scale) as f32);
                    vertices.push(((bx + offset_x) * scale) as f32);
                    vertices.push(((by + offset_y) * scale) as f32);
                }

                if vertices.len() >= chunk_floats {
                    let progress = (level_idx as f64 + y as f64 / (height - 1) as f64)
                        / levels.len() as f64;
                    callback(level, &vertices, &indices, progress);
                    vertices.clear();
                    indices.clear();
                }
            }
        }

        let progress = (level_idx + 1) as f64 / levels.len() as f64;
        callback(level, &vertices, &indices, progress);
    }

    tracing::debug!(
        "traced {} levels over {}x{} in {:.3} ms",
        levels.len(),
        width,
        height,
        start.elapsed().as_secs_f64() * 1e3
    );
}

#[allow(clippy::too_many_arguments)]
fn edge_point(
    edge: Edge,
    x: usize,
    y: usize,
    v00: f32,
    v10: f32,
    v01: f32,
    v11: f32,
    level: f64,
) -> (f64, f64) {
    let (x, y) = (x as f64, y as f64);
    match edge {
        Edge::Bottom => (x + interp(v00, v10, level), y),
        Edge::Top => (x + interp(v01, v11, level), y + 1.0),
        Edge::Left => (x, y + interp(v00, v01, level)),
        Edge::Right => (x + 1.0, y + interp(v10, v11, level)),
    }
}

/// Fraction along `a -> b` where the level crosses.
#[inline]
fn interp(a: f32, b: f32, level: f64) -> f64 {
    let (a, b) = (a as f64, b as f64);
    if (b - a).abs() < f64::EPSILON {
        0.5
    } else {
        ((level - a) / (b - a)).clamp(0.0, 1.0)
    }
}
