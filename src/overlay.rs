//! Status text drawn onto published frames.
//!
//! Three lines in the top-left corner: capture timestamp, helmet verdict with the
//! confidence threshold, and gate state (with a `MANUAL` marker while overridden).
//! Text uses a built-in 5x7 bitmap font scaled to the frame height.

use image::{Rgb, RgbImage};

use crate::frame::Frame;
use crate::gate::GateState;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const SHADOW: Rgb<u8> = Rgb([0, 0, 0]);

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const MARGIN: i32 = 10;

/// What the overlay reports for one cycle.
#[derive(Clone, Copy, Debug)]
pub struct OverlayStatus {
    pub helmet_present: bool,
    pub confidence_threshold: f32,
    pub gate_state: GateState,
    pub manual_override: bool,
}

/// Lines and colors for `status`, top to bottom.
pub fn overlay_lines(frame: &Frame, status: &OverlayStatus) -> [(String, Rgb<u8>); 3] {
    let timestamp = frame.captured_at.format("%Y-%m-%d %H:%M:%S").to_string();
    let helmet = format!(
        "HELMET={}  (CONF>={:.2})",
        if status.helmet_present { "TRUE" } else { "FALSE" },
        status.confidence_threshold
    );
    let mut gate = format!("GATE: {}", status.gate_state.as_str().to_uppercase());
    if status.manual_override {
        gate.push_str("  MANUAL");
    }
    let gate_color = match status.gate_state {
        GateState::Open => GREEN,
        GateState::Closed => RED,
    };
    [
        (timestamp, GREEN),
        (helmet, if status.helmet_present { GREEN } else { RED }),
        (gate, gate_color),
    ]
}

/// Draw the status lines onto `frame` in place.
pub fn annotate(frame: &mut Frame, status: &OverlayStatus) {
    let lines = overlay_lines(frame, status);
    let scale = text_scale(frame.height());
    let line_step = (GLYPH_H + 4) * scale;
    let image = frame.image_mut();
    for (i, (text, color)) in lines.iter().enumerate() {
        let y = MARGIN + i as i32 * line_step;
        draw_text(image, MARGIN + 1, y + 1, text, scale, SHADOW);
        draw_text(image, MARGIN, y, text, scale, *color);
    }
}

fn text_scale(height: u32) -> i32 {
    (height / 240).max(1) as i32
}

/// Pixel width of `text` at `scale`.
#[cfg(test)]
fn text_width(text: &str, scale: i32) -> i32 {
    text.chars().count() as i32 * (GLYPH_W + 1) * scale
}

fn draw_text(image: &mut RgbImage, mut x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        let glyph = glyph_bits(ch).unwrap_or(UNKNOWN);
        for (row, pattern) in glyph.iter().enumerate() {
            for col in 0..GLYPH_W {
                if (pattern >> (GLYPH_W - 1 - col)) & 1 == 1 {
                    fill_block(image, x + col * scale, y + row as i32 * scale, scale, color);
                }
            }
        }
        x += (GLYPH_W + 1) * scale;
    }
}

fn fill_block(image: &mut RgbImage, left: i32, top: i32, size: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for py in top.max(0)..(top + size).min(height) {
        for px in left.max(0)..(left + size).min(width) {
            image.put_pixel(px as u32, py as u32, color);
        }
    }
}

const UNKNOWN: [u8; 7] = [
    0b11111, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11111,
];

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        '=' => [0, 0, 0b11111, 0, 0b11111, 0, 0],
        '>' => [0b01000, 0b00100, 0b00010, 0b00001, 0b00010, 0b00100, 0b01000],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
