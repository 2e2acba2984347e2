use strata_core::RegionPos;

/// Outcome of asking the queue for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// A region to process; its neighborhood is now locked.
    Cell(RegionPos),
    /// Work remains but every eligible cell conflicts with an active
    /// neighborhood. Back off and ask again.
    Busy,
    /// Every cell has been handed out.
    Done,
}

#[derive(Clone, Copy, Default)]
struct Cell {
    weight: f32,
    done: bool,
    locked: bool,
}

/// Spatial work queue over the bounding rectangle of a region set.
///
/// `next` hands out the pending cell whose Chebyshev neighborhood
/// carries the most remaining weight, then locks that neighborhood so
/// concurrent callers cannot take anything within `radius` of it.
/// Callers release the neighborhood with `unlock_around` when the cell
/// is finished. A radius of zero disables neighbor exclusion entirely.
pub struct Queue2d {
    min_x: i32,
    min_z: i32,
    width: i32,
    height: i32,
    radius: i32,
    cells: Vec<Cell>,
    pending: usize,
}

impl Queue2d {
    pub fn new(radius: i32, items: impl IntoIterator<Item = (RegionPos, f32)>) -> Self {
        let items: Vec<(RegionPos, f32)> = items.into_iter().collect();
        if items.is_empty() {
            return Self {
                min_x: 0,
                min_z: 0,
                width: 0,
                height: 0,
                radius,
                cells: Vec::new(),
                pending: 0,
            };
        }
        let min_x = items.iter().map(|(r, _)| r.x).min().unwrap();
        let max_x = items.iter().map(|(r, _)| r.x).max().unwrap();
        let min_z = items.iter().map(|(r, _)| r.z).min().unwrap();
        let max_z = items.iter().map(|(r, _)| r.z).max().unwrap();
        let width = max_x - min_x + 1;
        let height = max_z - min_z + 1;
        // Cells inside the rectangle that hold no region start out done
        // so they are never handed out.
        let mut cells = vec![
            Cell {
                done: true,
                ..Cell::default()
            };
            (width as usize) * (height as usize)
        ];
        let mut pending = 0;
        for (region, weight) in items {
            let idx = ((region.z - min_z) * width + (region.x - min_x)) as usize;
            if cells[idx].done {
                pending += 1;
            }
            cells[idx] = Cell {
                weight,
                done: false,
                locked: false,
            };
        }
        Self {
            min_x,
            min_z,
            width,
            height,
            radius,
            cells,
            pending,
        }
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.pending
    }

    fn idx(&self, x: i32, z: i32) -> usize {
        (z * self.width + x) as usize
    }

    fn pos(&self, idx: usize) -> RegionPos {
        let x = idx as i32 % self.width;
        let z = idx as i32 / self.width;
        RegionPos {
            x: self.min_x + x,
            z: self.min_z + z,
        }
    }

    fn neighborhood(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        let cx = idx as i32 % self.width;
        let cz = idx as i32 / self.width;
        let r = self.radius;
        ((cz - r).max(0)..=(cz + r).min(self.height - 1)).flat_map(move |z| {
            ((cx - r).max(0)..=(cx + r).min(self.width - 1)).map(move |x| self.idx(x, z))
        })
    }

    fn blocked(&self, idx: usize) -> bool {
        self.neighborhood(idx).any(|n| self.cells[n].locked)
    }

    fn score(&self, idx: usize) -> f32 {
        self.neighborhood(idx)
            .filter(|&n| !self.cells[n].done)
            .map(|n| self.cells[n].weight)
            .sum()
    }

    /// Pick the unblocked pending cell with the heaviest remaining
    /// neighborhood. Ties keep the first cell encountered in row-major
    /// order.
    pub fn next(&mut self) -> Next {
        if self.pending == 0 {
            return Next::Done;
        }
        let mut best: Option<(usize, f32)> = None;
        for idx in 0..self.cells.len() {
            if self.cells[idx].done || self.blocked(idx) {
                continue;
            }
            let score = self.score(idx);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }
        match best {
            Some((idx, _)) => {
                self.cells[idx].done = true;
                self.pending -= 1;
                let locks: Vec<usize> = self.neighborhood(idx).collect();
                for n in locks {
                    self.cells[n].locked = true;
                }
                Next::Cell(self.pos(idx))
            }
            None => Next::Busy,
        }
    }

    /// Release the neighborhood locked when `region` was handed out.
    ///
    /// Neighborhoods of concurrently active cells never overlap, so
    /// clearing the flags cannot release a lock another worker still
    /// relies on: every cell within the radius of a different active
    /// center would have blocked this cell from being handed out in the
    /// first place.
    pub fn unlock_around(&mut self, region: RegionPos) {
        let cx = region.x - self.min_x;
        let cz = region.z - self.min_z;
        if cx < 0 || cz < 0 || cx >= self.width || cz >= self.height {
            return;
        }
        let idx = self.idx(cx, cz);
        let cells: Vec<usize> = self.neighborhood(idx).collect();
        for n in cells {
            self.cells[n].locked = false;
        }
    }
}
