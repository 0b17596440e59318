// Forsyth linear-speed triangle-order optimization
//
// Reorders an index list so that triangles sharing vertices are emitted
// close together, which keeps the post-transform vertex cache warm.
// Geometry registries run every index buffer through this once before
// staging it. The output is a permutation of the input at triangle
// granularity; vertex indices within a triangle are never rewritten.

use crate::{Result, StratusError};

/// Modelled post-transform cache size, including the three entries for
/// the most recent triangle.
const CACHE_SIZE: usize = 32;
const CACHE_DECAY_POWER: f32 = 1.5;
/// Score for vertices used by the last emitted triangle.
const LAST_TRI_SCORE: f32 = 0.75;
const VALENCE_BOOST_SCALE: f32 = 2.0;
const VALENCE_BOOST_POWER: f32 = 0.5;

fn vertex_score(cache_pos: Option<usize>, remaining_valence: u32) -> f32 {
    if remaining_valence == 0 {
        // No triangle needs this vertex anymore
        return -1.0;
    }

    let mut score = match cache_pos {
        None => 0.0,
        // Vertices of the most recent triangle get a fixed score so we
        // don't chain thin strips forever
        Some(pos) if pos < 3 => LAST_TRI_SCORE,
        Some(pos) => {
            let scale = 1.0 / (CACHE_SIZE - 3) as f32;
            (1.0 - (pos - 3) as f32 * scale).max(0.0).powf(CACHE_DECAY_POWER)
        }
    };

    // Boost vertices with few remaining triangles so lone triangles do
    // not get stranded at the end
    score += VALENCE_BOOST_SCALE * (remaining_valence as f32).powf(-VALENCE_BOOST_POWER);
    score
}

/// Reorder `indices` for post-transform cache locality.
///
/// Fails with a validation error if the index count is not a multiple
/// of three.
pub fn optimize_triangle_ordering(indices: &[u32]) -> Result<Vec<u32>> {
    if indices.len() % 3 != 0 {
        return Err(StratusError::VALIDATION_FAILED);
    }
    if indices.is_empty() {
        return Ok(Vec::new());
    }

    let num_tris = indices.len() / 3;
    let num_verts = *indices.iter().max().unwrap() as usize + 1;

    // Per-vertex valence and triangle adjacency
    let mut valence = vec![0u32; num_verts];
    for &i in indices {
        valence[i as usize] += 1;
    }
    let mut adjacency: Vec<Vec<u32>> = vec![Vec::new(); num_verts];
    for tri in 0..num_tris {
        for k in 0..3 {
            adjacency[indices[tri * 3 + k] as usize].push(tri as u32);
        }
    }

    let mut cache_pos: Vec<Option<usize>> = vec![None; num_verts];
    let mut vert_score: Vec<f32> = (0..num_verts)
        .map(|v| vertex_score(None, valence[v]))
        .collect();
    let mut tri_emitted = vec![false; num_tris];
    let tri_score = |tri: usize, vert_score: &[f32]| -> f32 {
        (0..3)
            .map(|k| vert_score[indices[tri * 3 + k] as usize])
            .sum()
    };

    // LRU model of the cache, most recent first
    let mut cache: Vec<u32> = Vec::with_capacity(CACHE_SIZE + 3);
    let mut output = Vec::with_capacity(indices.len());

    for _ in 0..num_tris {
        // Prefer the best triangle touching the modelled cache; fall
        // back to a full scan when the cache runs dry
        let mut best_tri: Option<usize> = None;
        let mut best_score = f32::MIN;
        for &v in cache.iter() {
            for &tri in adjacency[v as usize].iter() {
                let tri = tri as usize;
                if !tri_emitted[tri] {
                    let score = tri_score(tri, &vert_score);
                    if score > best_score {
                        best_score = score;
                        best_tri = Some(tri);
                    }
                }
            }
        }
        if best_tri.is_none() {
            for tri in 0..num_tris {
                if !tri_emitted[tri] {
                    let score = tri_score(tri, &vert_score);
                    if score > best_score {
                        best_score = score;
                        best_tri = Some(tri);
                    }
                }
            }
        }

        let tri = best_tri.unwrap();
        tri_emitted[tri] = true;

        for k in 0..3 {
            let v = indices[tri * 3 + k];
            output.push(v);
            valence[v as usize] -= 1;

            // Move v to the front of the modelled cache
            if let Some(pos) = cache.iter().position(|&c| c == v) {
                cache.remove(pos);
            }
            cache.insert(0, v);
        }

        // Evict down to the modelled size and rescore what moved
        while cache.len() > CACHE_SIZE {
            let evicted = cache.pop().unwrap() as usize;
            cache_pos[evicted] = None;
            vert_score[evicted] = vertex_score(None, valence[evicted]);
        }
        for (pos, &v) in cache.iter().enumerate() {
            cache_pos[v as usize] = Some(pos);
            vert_score[v as usize] = vertex_score(Some(pos), valence[v as usize]);
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn triangle_multiset(indices: &[u32]) -> HashMap<[u32; 3], u32> {
        let mut set = HashMap::new();
        for tri in indices.chunks(3) {
            // Canonicalize rotation-invariantly so reordered output
            // still matches its source triangle
            let mut t = [tri[0], tri[1], tri[2]];
            t.sort_unstable();
            *set.entry(t).or_insert(0) += 1;
        }
        set
    }

    #[test]
    fn output_is_triangle_permutation() {
        // A small grid of quads split into triangles
        let mut indices = Vec::new();
        for y in 0..4u32 {
            for x in 0..4u32 {
                let base = y * 5 + x;
                indices.extend_from_slice(&[base, base + 1, base + 5]);
                indices.extend_from_slice(&[base + 1, base + 6, base + 5]);
            }
        }

        let optimized = optimize_triangle_ordering(&indices).unwrap();
        assert_eq!(optimized.len(), indices.len());
        assert_eq!(triangle_multiset(&optimized), triangle_multiset(&indices));
    }

    #[test]
    fn rejects_partial_triangles() {
        assert_eq!(
            optimize_triangle_ordering(&[0, 1]),
            Err(StratusError::VALIDATION_FAILED)
        );
    }

    #[test]
    fn empty_input_is_fine() {
        assert_eq!(optimize_triangle_ordering(&[]).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn deterministic() {
        let indices = [0, 1, 2, 2, 1, 3, 3, 1, 0, 0, 2, 3];
        let a = optimize_triangle_ordering(&indices).unwrap();
        let b = optimize_triangle_ordering(&indices).unwrap();
        assert_eq!(a, b);
    }
}
