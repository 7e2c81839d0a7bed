//! resvg-backed SVG rasterizer, compiled with the `svg` feature.

use image::{Rgba, RgbaImage};
use resvg::{tiny_skia, usvg};

use crate::image_pipeline::{RasterizeError, SvgRasterizer};

#[derive(Default)]
pub struct ResvgRasterizer {
    options: usvg::Options<'static>,
}

impl SvgRasterizer for ResvgRasterizer {
    fn rasterize(&self, svg: &[u8], width_px: u32) -> Result<RgbaImage, RasterizeError> {
        let tree = usvg::Tree::from_data(svg, &self.options)
            .map_err(|_| RasterizeError::new("Parse"))?;
        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            return Err(RasterizeError::new("EmptyCanvas"));
        }
        let scale = width_px.max(1) as f32 / size.width();
        let height_px = (size.height() * scale).ceil().max(1.0) as u32;
        let mut pixmap = tiny_skia::Pixmap::new(width_px.max(1), height_px)
            .ok_or_else(|| RasterizeError::new("Allocation"))?;
        resvg::render(
            &tree,
            tiny_skia::Transform::from_scale(scale, scale),
            &mut pixmap.as_mut(),
        );

        let width = pixmap.width();
        let pixels = pixmap.pixels();
        Ok(RgbaImage::from_fn(width, height_px, |x, y| {
            let color = pixels[(y * width + x) as usize].demultiply();
            Rgba([color.red(), color.green(), color.blue(), color.alpha()])
        }))
    }
}
