//! Frame annotation: face boxes, labels, landmarks, clock, FPS and REC marker.

use crate::live::FaceSummary;
use ab_glyph::{FontArc, PxScale};
use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use std::path::Path;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

const LABEL_SCALE: f32 = 20.0;
const HUD_SCALE: f32 = 22.0;

pub struct Overlay {
    font: Option<FontArc>,
}

impl Overlay {
    /// Without a usable font only the shapes are drawn.
    pub fn load(font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| {
            let font = std::fs::read(path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| FontArc::try_from_vec(bytes).map_err(|e| e.to_string()));
            match font {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "overlay font unusable; drawing without text");
                    None
                }
            }
        });
        Self { font }
    }

    pub fn without_text() -> Self {
        Self { font: None }
    }

    pub fn draw(
        &self,
        image: &mut RgbImage,
        faces: &[FaceSummary],
        recording: bool,
        fps: f32,
        now: DateTime<Local>,
    ) {
        for face in faces {
            self.draw_face(image, face);
        }

        if let Some(font) = &self.font {
            let clock = now.format("%Y-%m-%d %H:%M:%S").to_string();
            draw_text_mut(image, WHITE, 10, 10, PxScale::from(HUD_SCALE), font, &clock);
            let fps_text = format!("FPS: {fps:.1}");
            draw_text_mut(image, YELLOW, 10, 36, PxScale::from(HUD_SCALE), font, &fps_text);
        }

        if recording {
            let x = image.width() as i32 - 30;
            draw_filled_circle_mut(image, (x, 20), 8, RED);
            if let Some(font) = &self.font {
                draw_text_mut(image, RED, x - 52, 10, PxScale::from(HUD_SCALE), font, "REC");
            }
        }
    }

    fn draw_face(&self, image: &mut RgbImage, face: &FaceSummary) {
        let color = if face.known { GREEN } else { RED };
        let (w, h) = (image.width() as i32, image.height() as i32);
        let x1 = (face.bbox.x1.round() as i32).clamp(0, w - 1);
        let y1 = (face.bbox.y1.round() as i32).clamp(0, h - 1);
        let x2 = (face.bbox.x2.round() as i32).clamp(0, w - 1);
        let y2 = (face.bbox.y2.round() as i32).clamp(0, h - 1);
        if x2 <= x1 || y2 <= y1 {
            return;
        }

        // 2px border
        for inset in 0..2 {
            let (rw, rh) = (x2 - x1 - 2 * inset, y2 - y1 - 2 * inset);
            if rw > 0 && rh > 0 {
                let rect = Rect::at(x1 + inset, y1 + inset).of_size(rw as u32, rh as u32);
                draw_hollow_rect_mut(image, rect, color);
            }
        }

        if let Some(landmarks) = &face.landmarks {
            for &(lx, ly) in landmarks {
                draw_filled_circle_mut(image, (lx.round() as i32, ly.round() as i32), 2, YELLOW);
            }
        }

        let Some(font) = &self.font else {
            return;
        };
        let text = if face.known {
            format!("{} ({:.2})", face.label, face.confidence)
        } else {
            face.label.clone()
        };
        let scale = PxScale::from(LABEL_SCALE);
        let (tw, th) = text_size(scale, font, &text);
        let box_h = th as i32 + 6;
        let top = if y1 >= box_h { y1 - box_h } else { y2 };
        draw_filled_rect_mut(
            image,
            Rect::at(x1, top).of_size(tw + 6, box_h as u32),
            color,
        );
        draw_text_mut(image, BLACK, x1 + 3, top + 3, scale, font, &text);
    }
}
