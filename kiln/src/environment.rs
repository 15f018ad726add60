use crate::{device::*, error::*, resource::*, usage::*};
use log::{info, warn};
use std::path::Path;

/// Lat-long radiance map, RGBA float pixels in row order.
#[derive(Debug, Clone)]
pub struct EnvironmentMap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<f32>,
}

impl EnvironmentMap {
    pub fn texture_desc(&self) -> TextureDesc {
        TextureDesc::new(
            self.width,
            self.height,
            TextureFormat::Rgba32Float,
            TextureUsage::SAMPLED,
        )
    }

    pub fn upload<D: Device>(&self, device: &D) -> Result<D::Texture> {
        upload_texture(
            device,
            &self.texture_desc(),
            bytemuck::cast_slice(&self.pixels),
            "environment map",
        )
    }
}

/// Decodes an HDR, EXR or PNG file.
pub fn load_environment_map(path: &Path) -> Result<EnvironmentMap> {
    let image = image::open(path).map_err(|err| Error::EnvironmentMap {
        path: path.to_owned(),
        reason: err.to_string(),
    })?;
    let image = image.into_rgba32f();
    let (width, height) = image.dimensions();
    info!("loaded environment map {:?}: {}x{}", path, width, height);
    Ok(EnvironmentMap {
        width,
        height,
        pixels: image.into_raw(),
    })
}

/// Logs a load failure and returns `None`, the caller binds its placeholder instead.
pub fn load_or_placeholder(path: Option<&Path>) -> Option<EnvironmentMap> {
    let path = path?;
    match load_environment_map(path) {
        Ok(map) => Some(map),
        Err(err) => {
            warn!("{}, using black environment", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.hdr");
        match load_environment_map(&path) {
            Err(err) => assert_eq!(err.severity(), Severity::Degraded),
            Ok(_) => panic!("expected a load failure"),
        }
        assert!(load_or_placeholder(Some(&path)).is_none());
        assert!(load_or_placeholder(None).is_none());
    }

    #[test]
    fn png_loads_as_float() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sky.png");
        image::RgbaImage::from_pixel(4, 2, image::Rgba([255, 0, 0, 255]))
            .save(&path)
            .unwrap();
        let map = load_environment_map(&path).unwrap();
        assert_eq!((map.width, map.height), (4, 2));
        assert_eq!(map.pixels.len(), 4 * 2 * 4);
        assert_eq!(&map.pixels[..4], &[1.0, 0.0, 0.0, 1.0]);
    }
}
