//! Color signatures and nearest-palette classification.

use crate::error::SorterError;
use crate::imaging::Pixels;
use crate::types::{LogicalIdentity, Rgb};
use serde::{Deserialize, Serialize};

/// Mean per-channel value of an image's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorSignature {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl ColorSignature {
    /// Mean RGB of `pixels`; `None` for an image without pixels.
    pub fn from_pixels(pixels: &Pixels) -> Option<Self> {
        let count = pixels.pixel_count();
        if count == 0 {
            return None;
        }
        let mut sums = [0u64; 3];
        for px in pixels.rgb.chunks_exact(3) {
            sums[0] += u64::from(px[0]);
            sums[1] += u64::from(px[1]);
            sums[2] += u64::from(px[2]);
        }
        let n = count as f64;
        Some(Self {
            r: sums[0] as f64 / n,
            g: sums[1] as f64 / n,
            b: sums[2] as f64 / n,
        })
    }

    pub fn from_rgb(rgb: Rgb) -> Self {
        Self {
            r: f64::from(rgb.r),
            g: f64::from(rgb.g),
            b: f64::from(rgb.b),
        }
    }

    /// Euclidean distance in RGB space.
    pub fn distance_to(&self, color: Rgb) -> f64 {
        let dr = self.r - f64::from(color.r);
        let dg = self.g - f64::from(color.g);
        let db = self.b - f64::from(color.b);
        (dr * dr + dg * dg + db * db).sqrt()
    }

    /// Classification channel message: `R,G,B|identity` with integer (truncated)
    /// channel means.
    pub fn to_wire(&self, identity: &LogicalIdentity) -> Vec<u8> {
        format!(
            "{},{},{}|{}",
            self.r.trunc() as u64,
            self.g.trunc() as u64,
            self.b.trunc() as u64,
            identity
        )
        .into_bytes()
    }

    /// Parse a classification channel message.
    pub fn parse_wire(message: &[u8]) -> Result<(Self, LogicalIdentity), SorterError> {
        let text = std::str::from_utf8(message)
            .map_err(|_| SorterError::MalformedMessage("signature is not UTF-8".to_string()))?;
        let (means, raw_id) = text.split_once('|').ok_or_else(|| {
            SorterError::MalformedMessage(format!("missing '|' in signature message '{}'", text))
        })?;
        let identity = LogicalIdentity::parse(raw_id).ok_or_else(|| {
            SorterError::MalformedMessage(format!("invalid identity '{}'", raw_id))
        })?;

        let channels: Vec<f64> = means
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| SorterError::MalformedMessage(format!("bad channel value: {}", e)))?;
        let &[r, g, b] = channels.as_slice() else {
            return Err(SorterError::MalformedMessage(format!(
                "expected three channel values, got {}",
                channels.len()
            )));
        };
        if [r, g, b].iter().any(|v| !(0.0..=255.0).contains(v)) {
            return Err(SorterError::MalformedMessage(format!(
                "channel values out of range in '{}'",
                means
            )));
        }
        Ok((Self { r, g, b }, identity))
    }
}

/// Operator-supplied target colors, fixed for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<Rgb>,
}

impl Palette {
    pub fn new(colors: Vec<Rgb>) -> Result<Self, SorterError> {
        if colors.is_empty() {
            return Err(SorterError::ConfigError(
                "palette needs at least one color".to_string(),
            ));
        }
        Ok(Self { colors })
    }

    /// Parse hex strings such as `#0E96B4`. Any invalid entry is a configuration
    /// error.
    pub fn from_hex<I, S>(values: I) -> Result<Self, SorterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let colors = values
            .into_iter()
            .map(|v| v.as_ref().parse::<Rgb>().map_err(SorterError::ConfigError))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(colors)
    }

    pub fn colors(&self) -> &[Rgb] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

/// Nearest palette entry for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub identity: LogicalIdentity,
    pub palette_index: usize,
    pub color: Rgb,
    pub distance: f64,
    pub signature: ColorSignature,
}

/// Pick the palette entry with the smallest distance; ties go to the lowest index.
pub fn classify(
    identity: LogicalIdentity,
    signature: ColorSignature,
    palette: &Palette,
) -> ClassificationResult {
    let mut best_index = 0;
    let mut best_distance = f64::INFINITY;
    for (index, color) in palette.colors.iter().enumerate() {
        let distance = signature.distance_to(*color);
        if distance < best_distance {
            best_index = index;
            best_distance = distance;
        }
    }
    ClassificationResult {
        identity,
        palette_index: best_index,
        color: palette.colors[best_index],
        distance: best_distance,
        signature,
    }
}
