//! CPU model of the cell grid
//!
//! The GPU owns the live state while the simulation runs; this module holds
//! the initial seeding, the host-side copy read back from the GPU, and a CPU
//! implementation of the transition rule used to check the compute shader.

use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

use crate::error::LifeError;

pub mod gpucompute;

pub const DEAD: u32 = 0;
pub const ALIVE: u32 = 1;

/// Offsets of the eight neighbours of a cell as `(dx, dy)`
const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Row-major grid of cell flags, one `u32` per cell to match the storage
/// buffer layout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellGrid {
    pub width: u32,
    pub height: u32,
    pub cells: Vec<u32>,
}

impl CellGrid {
    /// All-dead grid
    pub fn new(width: u32, height: u32) -> CellGrid {
        CellGrid {
            width,
            height,
            cells: vec![DEAD; (width * height) as usize],
        }
    }

    /// Grid where each cell is independently alive with `probability`
    pub fn random(width: u32, height: u32, probability: f32, rng: &mut fastrand::Rng) -> CellGrid {
        let cells = (0..width * height)
            .map(|_| if rng.f32() < probability { ALIVE } else { DEAD })
            .collect();
        CellGrid {
            width,
            height,
            cells,
        }
    }

    /// Build a grid from rows of `'#'` (alive) and `'.'` (dead)
    pub fn from_pattern(rows: &[&str]) -> Result<CellGrid, LifeError> {
        let width = rows.first().map_or(0, |r| r.chars().count());
        if width == 0 {
            return Err(LifeError::Config("pattern must not be empty".into()));
        }
        let mut cells = Vec::with_capacity(width * rows.len());
        for (y, row) in rows.iter().enumerate() {
            let len = row.chars().count();
            if len != width {
                return Err(LifeError::Config(format!(
                    "pattern row {y} has {len} cells, expected {width}"
                )));
            }
            cells.extend(row.chars().map(|c| if c == '#' { ALIVE } else { DEAD }));
        }
        Ok(CellGrid {
            width: width as u32,
            height: rows.len() as u32,
            cells,
        })
    }

    pub fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    pub fn get(&self, x: u32, y: u32) -> u32 {
        self.cells[self.index(x, y)]
    }

    pub fn is_alive(&self, x: u32, y: u32) -> bool {
        self.get(x, y) != DEAD
    }

    pub fn set(&mut self, x: u32, y: u32, alive: bool) {
        let idx = self.index(x, y);
        self.cells[idx] = if alive { ALIVE } else { DEAD };
    }

    pub fn population(&self) -> usize {
        self.cells.iter().filter(|&&c| c != DEAD).count()
    }

    /// Live neighbours of `(x, y)` with both axes wrapping around
    pub fn live_neighbours(&self, x: u32, y: u32) -> u32 {
        let (w, h) = (self.width as i64, self.height as i64);
        NEIGHBOURS
            .iter()
            .map(|&(dx, dy)| {
                let nx = (x as i64 + dx).rem_euclid(w) as u32;
                let ny = (y as i64 + dy).rem_euclid(h) as u32;
                self.get(nx, ny)
            })
            .sum()
    }

    /// Compute the next generation
    pub fn step(&self) -> CellGrid {
        let width = self.width;
        let cells = (0..self.cells.len())
            .into_par_iter()
            .with_min_len(width as usize)
            .map(|idx| {
                let x = idx as u32 % width;
                let y = idx as u32 / width;
                next_state(self.cells[idx], self.live_neighbours(x, y))
            })
            .collect();
        CellGrid {
            width: self.width,
            height: self.height,
            cells,
        }
    }

    /// Advance `steps` generations
    pub fn advance(&self, steps: usize) -> CellGrid {
        (0..steps).fold(self.clone(), |grid, _| grid.step())
    }
}

/// The transition rule applied to a single cell
pub fn next_state(current: u32, live_neighbours: u32) -> u32 {
    match live_neighbours {
        2 => current,
        3 => ALIVE,
        _ => DEAD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_table() {
        for n in 0..=8 {
            let expected_dead = if n == 3 { ALIVE } else { DEAD };
            let expected_alive = if n == 2 || n == 3 { ALIVE } else { DEAD };
            assert_eq!(next_state(DEAD, n), expected_dead, "dead cell, {n} neighbours");
            assert_eq!(next_state(ALIVE, n), expected_alive, "live cell, {n} neighbours");
        }
    }

    #[test]
    fn test_plus_without_centre_on_3x3_torus() {
        let grid = CellGrid::from_pattern(&[
            ".#.", //
            "#.#", //
            ".#.",
        ])
        .unwrap();
        // On a 3x3 torus every other cell is a neighbour, so nothing is
        // clipped at the edges
        assert_eq!(grid.live_neighbours(1, 1), 4);
        for (x, y) in [(0, 0), (2, 0), (0, 2), (2, 2)] {
            assert_eq!(grid.live_neighbours(x, y), 4, "corner ({x}, {y})");
        }
        assert_eq!(grid.live_neighbours(1, 0), 3);

        let next = grid.step();
        assert!(!next.is_alive(1, 1));
        assert!(next.is_alive(1, 0));
        assert!(next.is_alive(0, 1));
        assert!(!next.is_alive(0, 0));
    }

    #[test]
    fn test_plus_missing_one_arm_on_3x3_torus() {
        let grid = CellGrid::from_pattern(&[
            ".#.", //
            "#.#", //
            "...",
        ])
        .unwrap();
        assert_eq!(grid.live_neighbours(1, 1), 3);
        // Without wraparound (0, 2) would only see (0, 1)
        assert_eq!(grid.live_neighbours(0, 2), 3);

        let next = grid.step();
        assert!(next.is_alive(1, 1));
        assert!(next.is_alive(0, 2));
        // The three arms each keep two neighbours, so the whole torus fills
        assert_eq!(next.population(), 9);
    }

    #[test]
    fn test_centre_born_with_three_neighbours() {
        let grid = CellGrid::from_pattern(&[
            ".....", //
            "..#..", //
            ".#.#.", //
            ".....", //
            ".....",
        ])
        .unwrap();
        assert_eq!(grid.live_neighbours(2, 2), 3);
        assert!(grid.step().is_alive(2, 2));
    }

    #[test]
    fn test_wraparound_at_corner() {
        let mut grid = CellGrid::new(5, 5);
        grid.set(4, 4, true);
        grid.set(0, 4, true);
        grid.set(4, 0, true);
        // (0, 0) sees all three through the wrapped edges
        assert_eq!(grid.live_neighbours(0, 0), 3);
        assert!(grid.step().is_alive(0, 0));
    }

    #[test]
    fn test_pattern_rows_must_match() {
        let ragged = CellGrid::from_pattern(&["#.#", "#."]);
        assert!(matches!(ragged, Err(LifeError::Config(_))));
        assert!(CellGrid::from_pattern(&[]).is_err());
        assert!(CellGrid::from_pattern(&[""]).is_err());

        // Widths count characters, not bytes
        let grid = CellGrid::from_pattern(&["#·", "·#"]).unwrap();
        assert_eq!((grid.width, grid.height), (2, 2));
        assert_eq!(grid.population(), 2);
        assert!(grid.is_alive(1, 1));
    }

    #[test]
    fn test_isolated_cell_dies() {
        let mut grid = CellGrid::new(8, 8);
        grid.set(3, 4, true);
        let next = grid.step();
        assert_eq!(next.population(), 0);
    }

    #[test]
    fn test_live_cell_with_two_neighbours_survives() {
        let grid = CellGrid::from_pattern(&[
            "......", //
            ".#....", //
            "..#...", //
            "...#..", //
            "......",
        ])
        .unwrap();
        let next = grid.step();
        assert!(next.is_alive(2, 2));
        assert!(!next.is_alive(1, 1));
        assert!(!next.is_alive(3, 3));
    }

    #[test]
    fn test_dead_grid_stays_dead() {
        let grid = CellGrid::new(16, 9);
        assert_eq!(grid.advance(25), grid);
    }

    #[test]
    fn test_blinker_oscillates() {
        let grid = CellGrid::from_pattern(&[
            ".....", //
            ".....", //
            ".###.", //
            ".....", //
            ".....",
        ])
        .unwrap();
        let once = grid.step();
        assert!(once.is_alive(2, 1) && once.is_alive(2, 2) && once.is_alive(2, 3));
        assert_eq!(once.population(), 3);
        assert_eq!(grid.advance(2), grid);
    }

    #[test]
    fn test_glider_wraps_around_torus() {
        let grid = CellGrid::from_pattern(&[
            ".#......", //
            "..#.....", //
            "###.....", //
            "........", //
            "........", //
            "........", //
            "........", //
            "........",
        ])
        .unwrap();
        // A glider moves one cell diagonally every 4 generations, so after
        // 4 * 8 it is back where it started on an 8x8 torus
        assert_eq!(grid.advance(32), grid);
        assert_eq!(grid.advance(5).population(), 5);
    }

    #[test]
    fn test_deterministic_from_seed() {
        let a = CellGrid::random(40, 30, 0.4, &mut fastrand::Rng::with_seed(7));
        let b = CellGrid::random(40, 30, 0.4, &mut fastrand::Rng::with_seed(7));
        assert_eq!(a, b);
        assert_eq!(a.advance(20), b.advance(20));
    }

    #[test]
    fn test_random_density() {
        let grid = CellGrid::random(200, 200, 0.4, &mut fastrand::Rng::with_seed(1));
        let density = grid.population() as f32 / grid.cells.len() as f32;
        assert!((density - 0.4).abs() < 0.02, "density was {density}");
        assert!(grid.cells.iter().all(|&c| c == ALIVE || c == DEAD));
    }
}
