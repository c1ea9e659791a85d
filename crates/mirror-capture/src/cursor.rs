//! Cursor glyph compositing for backends whose grabs do not include the
//! pointer.

const GLYPH_SIZE: i32 = 10;

/// Draws a small white block with a 1px black border at the cursor position.
/// Coordinates are in the frame's local space; out-of-bounds positions are
/// clipped, fully off-screen cursors draw nothing.
pub fn overlay_cursor(
    data: &mut [u8],
    width: u32,
    height: u32,
    stride: u32,
    bytes_per_pixel: usize,
    cursor_x: i32,
    cursor_y: i32,
) {
    let w = width as i32;
    let h = height as i32;

    let x0 = cursor_x.max(0);
    let y0 = cursor_y.max(0);
    let x1 = (cursor_x + GLYPH_SIZE).min(w);
    let y1 = (cursor_y + GLYPH_SIZE).min(h);
    if x1 <= x0 || y1 <= y0 {
        return;
    }

    for y in y0..y1 {
        for x in x0..x1 {
            let border =
                y == y0 || y == y1 - 1 || x == x0 || x == x1 - 1;
            let value = if border { 0u8 } else { 255u8 };
            let off = y as usize * stride as usize + x as usize * bytes_per_pixel;
            // Alpha byte of BGRA stays untouched.
            for c in 0..bytes_per_pixel.min(3) {
                data[off + c] = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glyph_is_drawn_with_border() {
        let mut data = vec![128u8; 32 * 32 * 4];
        overlay_cursor(&mut data, 32, 32, 32 * 4, 4, 5, 5);
        // Border pixel is black, interior white.
        let border = 5 * 32 * 4 + 5 * 4;
        assert_eq!(&data[border..border + 3], &[0, 0, 0]);
        let interior = 7 * 32 * 4 + 7 * 4;
        assert_eq!(&data[interior..interior + 3], &[255, 255, 255]);
        // Alpha channel untouched.
        assert_eq!(data[interior + 3], 128);
    }

    #[test]
    fn offscreen_cursor_is_noop() {
        let mut data = vec![7u8; 16 * 16 * 4];
        let before = data.clone();
        overlay_cursor(&mut data, 16, 16, 16 * 4, 4, -20, -20);
        overlay_cursor(&mut data, 16, 16, 16 * 4, 4, 100, 100);
        assert_eq!(data, before);
    }

    #[test]
    fn clipped_cursor_stays_in_bounds() {
        let mut data = vec![0u8; 16 * 16 * 3];
        overlay_cursor(&mut data, 16, 16, 16 * 3, 3, 12, 12);
        // Just checking no panic and some pixels changed.
        assert!(data.iter().any(|&b| b != 0));
    }
}
