//! Startup configuration for the simulation
//!
//! Everything here is fixed once the event loop starts. Native builds can
//! override the defaults through `GPULIFE_*` environment variables, web builds
//! always use [`LifeConfig::default`].

use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::error::LifeError;

pub const DEFAULT_GRID_SIZE: u32 = 256;
pub const DEFAULT_TILE_SIZE: u32 = 8;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(32);
/// Chance that a cell starts alive
pub const DEFAULT_ALIVE_PROBABILITY: f32 = 0.4;

/// Immutable simulation grid parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridDescriptor {
    pub width: u32,
    pub height: u32,
    /// Side length of the square compute workgroup
    pub tile_size: u32,
}

impl GridDescriptor {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Result<Self, LifeError> {
        let grid = Self {
            width,
            height,
            tile_size,
        };
        grid.validate()?;
        Ok(grid)
    }

    pub fn validate(&self) -> Result<(), LifeError> {
        if self.width == 0 || self.height == 0 {
            return Err(LifeError::Config(format!(
                "grid must not be empty, got {}x{}",
                self.width, self.height
            )));
        }
        if self.tile_size == 0 {
            return Err(LifeError::Config("tile size must be at least 1".into()));
        }
        if self.width.checked_mul(self.height).is_none() {
            return Err(LifeError::Config(format!(
                "grid {}x{} has too many cells",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Check the workgroup shape and dispatch size against what `limits`
    /// allows, so an oversized grid fails at startup instead of on the
    /// first dispatch
    pub fn check_limits(&self, limits: &wgpu::Limits) -> Result<(), LifeError> {
        if self.tile_size > limits.max_compute_workgroup_size_x
            || self.tile_size > limits.max_compute_workgroup_size_y
        {
            return Err(LifeError::Config(format!(
                "tile size {} exceeds the device workgroup size limit of {}x{}",
                self.tile_size,
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y
            )));
        }
        let invocations = self.tile_size.checked_mul(self.tile_size);
        if invocations.is_none_or(|n| n > limits.max_compute_invocations_per_workgroup) {
            return Err(LifeError::Config(format!(
                "tile size {} exceeds the device limit of {} invocations per workgroup",
                self.tile_size, limits.max_compute_invocations_per_workgroup
            )));
        }
        let [x, y] = self.workgroup_counts();
        if x.max(y) > limits.max_compute_workgroups_per_dimension {
            return Err(LifeError::Config(format!(
                "grid needs {x}x{y} workgroups, the device allows {} per dimension",
                limits.max_compute_workgroups_per_dimension
            )));
        }
        Ok(())
    }

    pub fn cell_count(&self) -> u32 {
        self.width * self.height
    }

    /// Number of workgroups along x and y needed to cover every cell
    pub fn workgroup_counts(&self) -> [u32; 2] {
        [
            self.width.div_ceil(self.tile_size),
            self.height.div_ceil(self.tile_size),
        ]
    }

    pub fn uniform(&self) -> GridUniform {
        GridUniform {
            width: self.width,
            height: self.height,
        }
    }
}

impl Default for GridDescriptor {
    fn default() -> Self {
        Self {
            width: DEFAULT_GRID_SIZE,
            height: DEFAULT_GRID_SIZE,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

/// Grid dimensions as seen by both shaders (`vec2<u32>`)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct GridUniform {
    pub width: u32,
    pub height: u32,
}

/// How a cell quad is sized in the vertex stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CellGeometry {
    /// Quad scaled by the cell state, dead cells collapse to a point
    #[default]
    StateScaled,
    /// Every cell drawn at full size, coloured by coordinate only
    Static,
}

impl std::str::FromStr for CellGeometry {
    type Err = LifeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scaled" | "state" | "state-scaled" => Ok(Self::StateScaled),
            "static" | "coordinate" => Ok(Self::Static),
            other => Err(LifeError::Config(format!(
                "unknown cell geometry `{other}`, expected `scaled` or `static`"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LifeConfig {
    pub grid: GridDescriptor,
    pub tick_interval: Duration,
    pub alive_probability: f32,
    /// Fixed seed for the initial state; random when `None`
    pub seed: Option<u64>,
    pub geometry: CellGeometry,
    pub clear_color: wgpu::Color,
}

impl Default for LifeConfig {
    fn default() -> Self {
        Self {
            grid: GridDescriptor::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            alive_probability: DEFAULT_ALIVE_PROBABILITY,
            seed: None,
            geometry: CellGeometry::default(),
            clear_color: wgpu::Color {
                r: 0.0,
                g: 0.0,
                b: 0.4,
                a: 1.0,
            },
        }
    }
}

impl LifeConfig {
    /// Build a config from the process environment
    pub fn from_env() -> Result<Self, LifeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from defaults plus whatever `lookup` returns for the
    /// `GPULIFE_*` keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LifeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("GPULIFE_WIDTH") {
            config.grid.width = parse_value("GPULIFE_WIDTH", &v)?;
        }
        if let Some(v) = lookup("GPULIFE_HEIGHT") {
            config.grid.height = parse_value("GPULIFE_HEIGHT", &v)?;
        }
        if let Some(v) = lookup("GPULIFE_TILE_SIZE") {
            config.grid.tile_size = parse_value("GPULIFE_TILE_SIZE", &v)?;
        }
        if let Some(v) = lookup("GPULIFE_INTERVAL") {
            config.tick_interval = humantime::parse_duration(v.trim()).map_err(|e| {
                LifeError::Config(format!("GPULIFE_INTERVAL `{v}` is not a duration: {e}"))
            })?;
        }
        if let Some(v) = lookup("GPULIFE_DENSITY") {
            config.alive_probability = parse_value("GPULIFE_DENSITY", &v)?;
        }
        if let Some(v) = lookup("GPULIFE_SEED") {
            config.seed = Some(parse_value("GPULIFE_SEED", &v)?);
        }
        if let Some(v) = lookup("GPULIFE_GEOMETRY") {
            config.geometry = v.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LifeError> {
        self.grid.validate()?;
        if self.tick_interval.is_zero() {
            return Err(LifeError::Config("tick interval must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.alive_probability) {
            return Err(LifeError::Config(format!(
                "alive probability must be within 0..=1, got {}",
                self.alive_probability
            )));
        }
        Ok(())
    }
}

/// Log level from `GPULIFE_LOG`, `info` when unset
pub fn log_level_from_env() -> Result<log::LevelFilter, LifeError> {
    log_level_from_lookup(|key| std::env::var(key).ok())
}

pub fn log_level_from_lookup<F>(lookup: F) -> Result<log::LevelFilter, LifeError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("GPULIFE_LOG") {
        Some(v) => parse_value("GPULIFE_LOG", &v),
        None => Ok(log::LevelFilter::Info),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, LifeError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| LifeError::Config(format!("{key} `{raw}` is invalid: {e}")))
}
