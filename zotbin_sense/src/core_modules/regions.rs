// THEORY:
// The `region_finder` groups the "on" pixels of a binary motion mask into
// spatially coherent regions and reports each region's filled area. It is the
// stage that turns "these pixels changed" into "there is an object of this size".
//
// Algorithm steps:
// 1.  **Hole filling**: the background is flood-filled from the image border
//     (4-connected). Background pixels the fill cannot reach are enclosed by
//     foreground, so they count toward the enclosing region's area. This gives
//     the area of each region's outer outline, not just its lit pixels.
// 2.  **Region growing**: an iterative stack-based search over 8-connected
//     neighbors collects every pixel of each region, tracking its bounding box.
// 3.  **Stateless utility**: `find_regions` looks at one mask and has no memory
//     of previous frames.

use image::GrayImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// One connected region of a motion mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Top-left and bottom-right corners, inclusive.
    pub bounding_box: (Point, Point),
    /// Filled area in pixels, enclosed holes included.
    pub area: usize,
}

pub mod region_finder {
    use super::*;

    /// Finds all regions of non-zero pixels in `mask`.
    pub fn find_regions(mask: &GrayImage) -> Vec<Region> {
        let (width, height) = mask.dimensions();
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 {
            return Vec::new();
        }

        let mut filled: Vec<bool> = mask.pixels().map(|p| p[0] != 0).collect();
        fill_holes(&mut filled, w, h);

        let mut visited = vec![false; w * h];
        let mut regions = Vec::new();
        for start in 0..w * h {
            if filled[start] && !visited[start] {
                regions.push(grow_region(start, &filled, &mut visited, w, h));
            }
        }
        regions
    }

    /// Largest region area in `mask`, or 0 when the mask is empty.
    pub fn largest_area(mask: &GrayImage) -> usize {
        find_regions(mask).iter().map(|r| r.area).max().unwrap_or(0)
    }

    fn fill_holes(filled: &mut [bool], w: usize, h: usize) {
        let mut outside = vec![false; w * h];
        let mut stack: Vec<usize> = Vec::new();

        let border = (0..w)
            .flat_map(|x| [x, (h - 1) * w + x])
            .chain((0..h).flat_map(|y| [y * w, y * w + w - 1]));
        for idx in border {
            if !filled[idx] && !outside[idx] {
                outside[idx] = true;
                stack.push(idx);
            }
        }

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            let neighbors = [
                (x > 0).then(|| idx - 1),
                (x + 1 < w).then(|| idx + 1),
                (y > 0).then(|| idx - w),
                (y + 1 < h).then(|| idx + w),
            ];
            for n in neighbors.into_iter().flatten() {
                if !filled[n] && !outside[n] {
                    outside[n] = true;
                    stack.push(n);
                }
            }
        }

        for (cell, out) in filled.iter_mut().zip(outside) {
            if !out {
                *cell = true;
            }
        }
    }

    fn grow_region(start: usize, filled: &[bool], visited: &mut [bool], w: usize, h: usize) -> Region {
        let mut stack = vec![start];
        visited[start] = true;

        let mut area = 0;
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0, 0);

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if filled[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }

        Region {
            bounding_box: (
                Point { x: min_x as u32, y: min_y as u32 },
                Point { x: max_x as u32, y: max_y as u32 },
            ),
            area,
        }
    }
}
