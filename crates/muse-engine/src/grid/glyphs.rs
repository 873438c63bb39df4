use image::{Rgb, RgbImage};

pub const BADGE_HEIGHT: u32 = 28;

const GLYPH_COLS: u32 = 5;
const GLYPH_ROWS: u32 = 7;
const SCALE: u32 = 2;
const ADVANCE: u32 = 12;
const PAD_LEFT: u32 = 8;
const PAD_TOP: u32 = (BADGE_HEIGHT - GLYPH_ROWS * SCALE) / 2;

const BADGE_FILL: Rgb<u8> = Rgb([24, 24, 24]);
const BADGE_INK: Rgb<u8> = Rgb([255, 255, 255]);

// 5x7 rows, bit 4 is the leftmost column.
const GLYPHS: [(char, [u8; 7]); 11] = [
    ('#', [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A]),
    ('0', [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E]),
    ('1', [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E]),
    ('2', [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F]),
    ('3', [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E]),
    ('4', [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02]),
    ('5', [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E]),
    ('6', [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E]),
    ('7', [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08]),
    ('8', [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E]),
    ('9', [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C]),
];

fn glyph(ch: char) -> Option<&'static [u8; 7]> {
    GLYPHS
        .iter()
        .find(|(candidate, _)| *candidate == ch)
        .map(|(_, rows)| rows)
}

/// Width of the badge for an id with `digits` digits.
pub fn badge_width(digits: usize) -> u32 {
    ((digits as u32 + 1) * ADVANCE + 12).max(40)
}

/// Paints an opaque `#<id>` badge with its top-left corner at `(x, y)`.
/// Pixels falling outside the canvas are skipped.
pub fn draw_badge(canvas: &mut RgbImage, x: u32, y: u32, id: u64) {
    let text = format!("#{id}");
    let width = badge_width(text.len() - 1);
    fill_rect(canvas, x, y, width, BADGE_HEIGHT, BADGE_FILL);

    for (slot, ch) in text.chars().enumerate() {
        let Some(rows) = glyph(ch) else {
            continue;
        };
        let origin_x = x + PAD_LEFT + slot as u32 * ADVANCE;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_COLS {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                fill_rect(
                    canvas,
                    origin_x + col * SCALE,
                    y + PAD_TOP + row as u32 * SCALE,
                    SCALE,
                    SCALE,
                    BADGE_INK,
                );
            }
        }
    }
}

fn fill_rect(canvas: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let x_end = x.saturating_add(width).min(canvas.width());
    let y_end = y.saturating_add(height).min(canvas.height());
    for py in y..y_end {
        for px in x..x_end {
            canvas.put_pixel(px, py, color);
        }
    }
}

/// Reads back the badge text at `(x, y)` by matching glyph bitmaps.
#[cfg(test)]
pub fn read_badge(canvas: &RgbImage, x: u32, y: u32) -> String {
    let mut text = String::new();
    for slot in 0.. {
        let origin_x = x + PAD_LEFT + slot * ADVANCE;
        if origin_x + GLYPH_COLS * SCALE > canvas.width() {
            break;
        }
        let mut rows = [0u8; 7];
        for (row, bits) in rows.iter_mut().enumerate() {
            for col in 0..GLYPH_COLS {
                let pixel =
                    canvas.get_pixel(origin_x + col * SCALE, y + PAD_TOP + row as u32 * SCALE);
                if *pixel == BADGE_INK {
                    *bits |= 0x10 >> col;
                }
            }
        }
        match GLYPHS.iter().find(|(_, candidate)| *candidate == rows) {
            Some((ch, _)) => text.push(*ch),
            None => break,
        }
    }
    text
}
