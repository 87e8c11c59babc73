//! Merging raw window hits into detections.
//!
//! Candidates are clustered by rectangle similarity (transitively, via a
//! union-find partition), each cluster is replaced by its mean rectangle, and
//! clusters without enough support are dropped. A small cluster sitting
//! inside a much better supported one is suppressed as well.

use serde::{Deserialize, Serialize};

use crate::types::Rect;

/// A grouped rectangle and the number of candidates merged into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Detection {
    pub rect: Rect,
    pub neighbors: usize,
}

/// Two rectangles are similar when every edge of one lies within
/// `eps * (min width + min height) / 2` of the matching edge of the other.
pub fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: i32, q: i32| ((p - q).abs() as f64) <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

/// Split `items` into equivalence classes of the transitive closure of
/// `equivalent`. Returns a class label per item and the number of classes;
/// labels are numbered in order of first appearance.
pub fn partition<T, F>(items: &[T], mut equivalent: F) -> (Vec<usize>, usize)
where
    F: FnMut(&T, &T) -> bool,
{
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let n = items.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in i + 1..n {
            if equivalent(&items[i], &items[j]) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut labels = Vec::with_capacity(n);
    let mut classes = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }
    (labels, classes)
}

/// Cluster `candidates` and keep clusters of at least `group_threshold`
/// members. A threshold of zero or less disables grouping: every candidate is
/// returned as its own detection with one neighbor.
pub fn group_rectangles(candidates: &[Rect], group_threshold: i32, eps: f64) -> Vec<Detection> {
    if group_threshold <= 0 || candidates.is_empty() {
        return candidates
            .iter()
            .map(|&rect| Detection { rect, neighbors: 1 })
            .collect();
    }
    let threshold = group_threshold as usize;

    // Emission order depends on scheduling; sort so clustering does not.
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by_key(|r| (r.x, r.y, r.width, r.height));

    let (labels, classes) = partition(&sorted, |a, b| similar(a, b, eps));

    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (rect, &label) in sorted.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += rect.x as i64;
        s[1] += rect.y as i64;
        s[2] += rect.width as i64;
        s[3] += rect.height as i64;
        counts[label] += 1;
    }

    let clusters: Vec<Detection> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let mean = |v: i64| (v as f64 / n as f64).round() as i32;
            Detection {
                rect: Rect::new(mean(s[0]), mean(s[1]), mean(s[2]), mean(s[3])),
                neighbors: n,
            }
        })
        .collect();

    let supported: Vec<&Detection> = clusters.iter().filter(|d| d.neighbors >= threshold).collect();

    supported
        .iter()
        .enumerate()
        .filter(|&(i, inner)| {
            !supported.iter().enumerate().any(|(j, outer)| {
                if i == j {
                    return false;
                }
                let dx = (outer.rect.width as f64 * eps).round() as i32;
                let dy = (outer.rect.height as f64 * eps).round() as i32;
                inner.rect.inside_with_slack(&outer.rect, dx, dy)
                    && (outer.neighbors > inner.neighbors.max(3) || inner.neighbors < 3)
            })
        })
        .map(|(_, d)| **d)
        .collect()
}

/// The detection with the largest area, first one on ties.
pub fn largest(detections: &[Detection]) -> Option<Detection> {
    detections.iter().fold(None, |best: Option<Detection>, d| match best {
        Some(b) if b.rect.area() >= d.rect.area() => Some(b),
        _ => Some(*d),
    })
}

/// Group candidates and optionally keep only the largest resulting object.
pub fn group_candidates(
    candidates: &[Rect],
    group_threshold: i32,
    eps: f64,
    largest_only: bool,
) -> Vec<Detection> {
    let grouped = group_rectangles(candidates, group_threshold, eps);
    if largest_only {
        largest(&grouped).into_iter().collect()
    } else {
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jittered(x: i32, y: i32, size: i32, n: i32) -> Vec<Rect> {
        (0..n)
            .map(|i| Rect::new(x + i % 3 - 1, y + i % 2, size + i % 2, size))
            .collect()
    }

    #[test]
    fn similarity_uses_relative_slack() {
        let a = Rect::new(0, 0, 100, 100);
        // delta = 0.2 * (100 + 100) / 2 = 20
        assert!(similar(&a, &Rect::new(20, 0, 100, 100), 0.2));
        assert!(!similar(&a, &Rect::new(21, 0, 100, 100), 0.2));
        assert!(similar(&a, &Rect::new(5, 5, 90, 90), 0.2));
        // Identical rects are similar even with zero tolerance.
        assert!(similar(&a, &a, 0.0));
    }

    #[test]
    fn partition_is_transitive() {
        let items = [0, 5, 10, 100, 104];
        let (labels, classes) = partition(&items, |a: &i32, b: &i32| (a - b).abs() <= 5);
        assert_eq!(classes, 2);
        assert_eq!(labels, vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn zero_threshold_returns_raw_candidates() {
        let raw = vec![Rect::new(0, 0, 10, 10), Rect::new(1, 1, 10, 10), Rect::new(50, 50, 5, 5)];
        let out = group_rectangles(&raw, 0, 0.2);
        assert_eq!(out.len(), raw.len());
        assert!(out.iter().all(|d| d.neighbors == 1));
        assert_eq!(out[2].rect, raw[2]);
        assert!(group_rectangles(&[], 3, 0.2).is_empty());
    }

    #[test]
    fn overlapping_candidates_merge_into_mean() {
        let mut raw = jittered(40, 40, 50, 6);
        raw.push(Rect::new(200, 200, 30, 30));
        raw.push(Rect::new(0, 300, 30, 30));

        let out = group_rectangles(&raw, 3, 0.2);
        assert_eq!(out.len(), 1);
        let d = out[0];
        assert_eq!(d.neighbors, 6);
        assert!((d.rect.x - 40).abs() <= 1 && (d.rect.y - 40).abs() <= 1);
        assert!((d.rect.width - 50).abs() <= 1);

        // Isolated hits survive when the threshold allows single members.
        assert_eq!(group_rectangles(&raw, 1, 0.2).len(), 3);
    }

    #[test]
    fn result_is_independent_of_candidate_order() {
        let mut raw = jittered(10, 10, 40, 5);
        raw.extend(jittered(120, 30, 60, 4));
        let forward = group_rectangles(&raw, 2, 0.2);
        raw.reverse();
        let backward = group_rectangles(&raw, 2, 0.2);
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 2);
    }

    #[test]
    fn nested_weak_cluster_is_suppressed() {
        let mut raw = vec![Rect::new(0, 0, 100, 100); 6];
        raw.extend(vec![Rect::new(40, 40, 20, 20); 3]);

        let out = group_rectangles(&raw, 3, 0.2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], Detection { rect: Rect::new(0, 0, 100, 100), neighbors: 6 });

        // Equal support: the inner cluster stays.
        let mut raw = vec![Rect::new(0, 0, 100, 100); 3];
        raw.extend(vec![Rect::new(40, 40, 20, 20); 3]);
        assert_eq!(group_rectangles(&raw, 3, 0.2).len(), 2);
    }

    #[test]
    fn largest_object_keeps_biggest_cluster() {
        let mut raw = jittered(0, 0, 30, 4);
        raw.extend(jittered(100, 100, 60, 4));
        let out = group_candidates(&raw, 2, 0.2, true);
        assert_eq!(out.len(), 1);
        assert!(out[0].rect.width >= 60);
        assert!(group_candidates(&[], 2, 0.2, true).is_empty());
    }
}
