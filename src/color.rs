//! Deterministic per-node colors.
//!
//! Every view renders a node with the color derived here, so the mapping must be stable
//! across views, processes and restarts: a SHA-256 digest of the node id, no seed, no
//! randomness. Saturation and value stay in the upper range (180-255) so colors remain
//! readable on light and dark backgrounds.

use sha2::{Digest, Sha256};

/// HSV color with hue in degrees `[0, 360)` and saturation/value on a 0-255 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeColor {
    pub hue: u16,
    pub saturation: u8,
    pub value: u8,
}

/// Map a node id to its color.
pub fn color_for(node_id: &str) -> NodeColor {
    let digest = node_digest(node_id);
    NodeColor {
        hue: ((digest[0] as u32 * 360) / 256) as u16,
        saturation: 180 + (digest[1] % 75),
        value: 180 + (digest[2] % 75),
    }
}

/// Full digest the color is derived from.
pub fn node_digest(node_id: &str) -> [u8; 32] {
    Sha256::digest(node_id.as_bytes()).into()
}

impl NodeColor {
    pub fn to_rgb(&self) -> (u8, u8, u8) {
        let s = self.saturation as f64 / 255.0;
        let v = self.value as f64 / 255.0;
        let c = v * s;
        let h = (self.hue % 360) as f64 / 60.0;
        let x = c * (1.0 - ((h % 2.0) - 1.0).abs());
        let m = v - c;
        let (r, g, b) = match h as u8 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let scale = |ch: f64| ((ch + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        (scale(r), scale(g), scale(b))
    }

    /// `#rrggbb` form of [`NodeColor::to_rgb`].
    pub fn hex(&self) -> String {
        let (r, g, b) = self.to_rgb();
        format!("#{:02x}{:02x}{:02x}", r, g, b)
    }
}
