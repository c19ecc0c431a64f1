use image::{Rgb, RgbImage};

use super::Detection;

const BOX_THICKNESS: u32 = 2;

const PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
];

fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Draw a rectangle outline for every detection, clipped to the image.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
        draw_box(image, detection, class_color(detection.class_id));
    }
}

fn draw_box(image: &mut RgbImage, d: &Detection, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    let clamp = |v: f32, max: u32| (v.max(0.0) as u32).min(max - 1);
    let left = clamp(d.x1.min(d.x2), width);
    let right = clamp(d.x1.max(d.x2), width);
    let top = clamp(d.y1.min(d.y2), height);
    let bottom = clamp(d.y1.max(d.y2), height);

    for t in 0..BOX_THICKNESS {
        let y_top = (top + t).min(bottom);
        let y_bottom = bottom.saturating_sub(t).max(top);
        for x in left..=right {
            image.put_pixel(x, y_top, color);
            image.put_pixel(x, y_bottom, color);
        }

        let x_left = (left + t).min(right);
        let x_right = right.saturating_sub(t).max(left);
        for y in top..=bottom {
            image.put_pixel(x_left, y, color);
            image.put_pixel(x_right, y, color);
        }
    }
}
