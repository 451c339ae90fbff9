use crate::{
    connection::ConnectionState,
    input_fusion::VelocityCommand,
    map_decoder::{CellClass, OccupancyGrid},
};
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub unknown: Rgba,
    pub free: Rgba,
    pub occupied: Rgba,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            unknown: Rgba::opaque(180, 180, 180),
            free: Rgba::opaque(255, 255, 255),
            occupied: Rgba::opaque(0, 0, 0),
        }
    }
}

impl Palette {
    pub fn color(&self, cell: CellClass) -> Rgba {
        match cell {
            CellClass::Unknown => self.unknown,
            CellClass::Free => self.free,
            CellClass::Occupied => self.occupied,
        }
    }
}

/// Packed RGBA image of one map frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Frame {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = (y * self.width + x) * 4;
        let pixel = self.pixels.get(index..index + 4)?;
        Some(Rgba {
            r: pixel[0],
            g: pixel[1],
            b: pixel[2],
            a: pixel[3],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusLine {
    pub state: ConnectionState,
    pub command: VelocityCommand,
    pub frequency: i64,
    pub rejected_frames: u64,
}

/// Where finished frames end up.
pub trait FrameSink: Send {
    fn draw(&mut self, frame: &Frame) -> Result<()>;

    fn show_status(&mut self, _status: &StatusLine) -> Result<()> {
        Ok(())
    }
}

pub struct Renderer {
    palette: Palette,
    sink: Box<dyn FrameSink>,
    last_frame: Option<Frame>,
}

impl Renderer {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self::with_palette(sink, Palette::default())
    }

    pub fn with_palette(sink: Box<dyn FrameSink>, palette: Palette) -> Self {
        Self {
            palette,
            sink,
            last_frame: None,
        }
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    /// Colors the grid and hands the frame to the sink before returning.
    pub fn render(&mut self, grid: &OccupancyGrid) -> Result<()> {
        let frame = self.colorize(grid);
        self.sink.draw(&frame)?;
        self.last_frame = Some(frame);
        Ok(())
    }

    pub fn show_status(&mut self, status: &StatusLine) -> Result<()> {
        self.sink.show_status(status)
    }

    pub fn colorize(&self, grid: &OccupancyGrid) -> Frame {
        let mut pixels = Vec::with_capacity(grid.cells().len() * 4);
        for cell in grid.cells() {
            let color = self.palette.color(*cell);
            pixels.extend_from_slice(&[color.r, color.g, color.b, color.a]);
        }
        Frame {
            width: grid.width(),
            height: grid.height(),
            pixels,
        }
    }
}
