use crate::error::{ConfigError, DecodeError};
use serde::Deserialize;

pub const DEFAULT_MAP_WIDTH: usize = 400;
pub const DEFAULT_MAP_HEIGHT: usize = 400;

const UNKNOWN_BYTE: u8 = 0;
const OCCUPIED_BYTE: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellClass {
    Unknown,
    Free,
    Occupied,
}

impl CellClass {
    /// Wire contract: 0 is unknown, 255 is occupied, everything else is free.
    pub fn from_byte(value: u8) -> Self {
        match value {
            UNKNOWN_BYTE => CellClass::Unknown,
            OCCUPIED_BYTE => CellClass::Occupied,
            _ => CellClass::Free,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDimensions {
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_height")]
    pub height: usize,
}

fn default_width() -> usize {
    DEFAULT_MAP_WIDTH
}

fn default_height() -> usize {
    DEFAULT_MAP_HEIGHT
}

impl Default for GridDimensions {
    fn default() -> Self {
        Self {
            width: DEFAULT_MAP_WIDTH,
            height: DEFAULT_MAP_HEIGHT,
        }
    }
}

impl GridDimensions {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }

    /// A frame must be a non-empty buffer whose length fits in `usize`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.width.checked_mul(self.height) {
            Some(count) if count > 0 && count <= isize::MAX as usize => Ok(()),
            _ => Err(ConfigError::MapSize {
                width: self.width,
                height: self.height,
            }),
        }
    }
}

/// Row major grid of classified cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyGrid {
    dimensions: GridDimensions,
    cells: Vec<CellClass>,
}

impl OccupancyGrid {
    pub fn width(&self) -> usize {
        self.dimensions.width
    }

    pub fn height(&self) -> usize {
        self.dimensions.height
    }

    pub fn dimensions(&self) -> GridDimensions {
        self.dimensions
    }

    pub fn cells(&self) -> &[CellClass] {
        &self.cells
    }

    pub fn get(&self, x: usize, y: usize) -> Option<CellClass> {
        if x >= self.dimensions.width || y >= self.dimensions.height {
            return None;
        }
        self.cells.get(y * self.dimensions.width + x).copied()
    }
}

/// Stateless decoder for inbound binary map frames.
#[derive(Debug, Clone, Copy)]
pub struct MapStreamDecoder {
    dimensions: GridDimensions,
}

impl MapStreamDecoder {
    pub fn new(dimensions: GridDimensions) -> Self {
        Self { dimensions }
    }

    pub fn dimensions(&self) -> GridDimensions {
        self.dimensions
    }

    /// Frames carry no header, the only check possible is the exact length.
    pub fn decode(&self, raw: &[u8]) -> Result<OccupancyGrid, DecodeError> {
        let expected = self.dimensions.cell_count();
        if raw.len() != expected {
            return Err(DecodeError::SizeMismatch {
                expected,
                actual: raw.len(),
            });
        }
        Ok(OccupancyGrid {
            dimensions: self.dimensions,
            cells: raw.iter().copied().map(CellClass::from_byte).collect(),
        })
    }
}
