//! Palettes and 4bpp tiled images.
//!
//! Colors are stored as little-endian BGR555 halfwords. Images are 8x8
//! tiles of packed nibbles (low nibble first), laid out left to right and
//! top to bottom.

use bytes::Bytes;

/// Colors in a 4bpp palette
pub const PALETTE_SIZE: usize = 16;

/// Bytes in one 4bpp tile
pub const TILE_BYTES: usize = 32;

/// An 8-bit RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgb {
    /// Red channel
    pub r: u8,
    /// Green channel
    pub g: u8,
    /// Blue channel
    pub b: u8,
}

impl Rgb {
    /// Creates a color from its channels
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Expands a BGR555 halfword
    pub fn from_bgr555(color: u16) -> Self {
        Self {
            r: ((color & 0x001F) << 3) as u8,
            g: ((color & 0x03E0) >> 2) as u8,
            b: ((color & 0x7C00) >> 7) as u8,
        }
    }
}

/// Sixteen colors used to render a 4bpp image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    /// Colors indexed by nibble value
    pub colors: [Rgb; PALETTE_SIZE],
}

/// Stand-in palette for images whose palette has not been identified
pub const DEFAULT_PALETTE: Palette = Palette {
    colors: [
        Rgb::new(0x00, 0x00, 0x00),
        Rgb::new(0xFF, 0x00, 0x00),
        Rgb::new(0xFF, 0xA5, 0x00),
        Rgb::new(0xFF, 0xFF, 0x00),
        Rgb::new(0x00, 0x80, 0x00),
        Rgb::new(0x00, 0x00, 0xFF),
        Rgb::new(0x4B, 0x00, 0x82),
        Rgb::new(0xEE, 0x82, 0xEE),
        Rgb::new(0x80, 0x80, 0x80),
        Rgb::new(0x00, 0xFF, 0xFF),
        Rgb::new(0xFF, 0x00, 0xFF),
        Rgb::new(0xFF, 0x00, 0xFF),
        Rgb::new(0xA5, 0x2A, 0x2A),
        Rgb::new(0xFF, 0xD7, 0x00),
        Rgb::new(0xDC, 0xDC, 0xDC),
        Rgb::new(0x22, 0x8B, 0x22),
    ],
};

impl Default for Palette {
    fn default() -> Self {
        DEFAULT_PALETTE
    }
}

impl Palette {
    /// Reads sixteen BGR555 colors; `None` if fewer than 32 bytes are given
    pub fn from_bgr555(data: &[u8]) -> Option<Self> {
        let raw = data.get(..PALETTE_SIZE * 2)?;
        let mut colors = [Rgb::default(); PALETTE_SIZE];
        for (color, pair) in colors.iter_mut().zip(raw.chunks_exact(2)) {
            *color = Rgb::from_bgr555(u16::from_le_bytes([pair[0], pair[1]]));
        }
        Some(Self { colors })
    }

    /// JASC-PAL text, the format most palette editors read
    pub fn to_jasc(&self) -> String {
        let mut out = format!("JASC-PAL\n0100\n{PALETTE_SIZE}\n");
        for color in &self.colors {
            out.push_str(&format!("{} {} {}\n", color.r, color.g, color.b));
        }
        out
    }
}

/// Width and height in pixels for `len` bytes of 4bpp tile data.
///
/// Starts from one column of tiles and folds it in half while it is taller
/// than wide, which yields square sheets for square tile counts and 2:1
/// sheets otherwise.
pub fn guess_dimensions(len: usize) -> (usize, usize) {
    let mut tall = len / TILE_BYTES;
    if tall == 0 {
        return (0, 0);
    }
    let mut wide = 1;
    while tall > wide && tall % 2 == 0 {
        wide *= 2;
        tall /= 2;
    }
    (wide * 8, tall * 8)
}

/// A decoded 4bpp tile sheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiledImage {
    /// Width in pixels, a multiple of 8
    pub width: usize,
    /// Height in pixels, a multiple of 8
    pub height: usize,
    /// Raw packed tile data
    pub data: Bytes,
}

impl TiledImage {
    /// Wraps tile data using [`guess_dimensions`]
    pub fn from_tiles(data: Bytes) -> Self {
        let (width, height) = guess_dimensions(data.len());
        Self {
            width,
            height,
            data,
        }
    }

    /// Palette indices in row-major order
    pub fn pixels(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.width * self.height];
        let tiles_per_row = self.width / 8;
        if tiles_per_row == 0 {
            return out;
        }

        let nibbles = self
            .data
            .iter()
            .flat_map(|byte| [byte & 0x0F, byte >> 4]);
        for (index, value) in nibbles.take(out.len()).enumerate() {
            let tile = index / 64;
            let within = index % 64;
            let x = (tile % tiles_per_row) * 8 + within % 8;
            let y = (tile / tiles_per_row) * 8 + within / 8;
            out[y * self.width + x] = value;
        }
        out
    }

    /// Row-major RGB triples through `palette`
    pub fn to_rgb(&self, palette: &Palette) -> Vec<u8> {
        self.pixels()
            .into_iter()
            .flat_map(|index| {
                let color = palette.colors[usize::from(index) & 0x0F];
                [color.r, color.g, color.b]
            })
            .collect()
    }

    /// Binary PPM (P6) rendering through `palette`
    pub fn to_ppm(&self, palette: &Palette) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend(self.to_rgb(palette));
        out
    }
}
