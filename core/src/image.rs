//! Pixel buffers into tensors (`MNN_ImageProcess`).

use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;

use tracing::debug;

use crate::error::{BridgeError, ErrorCode, Result};
use crate::ffi::{MnnImageProcess, RawImageProcessConfig};
use crate::handle::Handle;
use crate::matrix::Matrix;
use crate::native::NativeApi;
use crate::pin;
use crate::tensor::TensorAccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Rgba = 0,
    Rgb = 1,
    Bgr = 2,
    Gray = 3,
    Bgra = 4,
    YCrCb = 5,
    Yuv = 6,
    Hsv = 7,
    Xyz = 8,
    Bgr555 = 9,
    Bgr565 = 10,
    Nv21 = 11,
    Nv12 = 12,
    I420 = 13,
    HsvFull = 14,
}

impl ImageFormat {
    /// Bytes per pixel of packed formats; `None` for planar and packed
    /// 16-bit ones.
    pub fn channels(self) -> Option<usize> {
        match self {
            Self::Rgba | Self::Bgra => Some(4),
            Self::Rgb | Self::Bgr | Self::YCrCb | Self::Yuv | Self::Hsv | Self::Xyz | Self::HsvFull => {
                Some(3)
            }
            Self::Gray => Some(1),
            Self::Bgr555 | Self::Bgr565 | Self::Nv21 | Self::Nv12 | Self::I420 => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Filter {
    #[default]
    Nearest = 0,
    Bilinear = 1,
    Bicubic = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Wrap {
    #[default]
    ClampToEdge = 0,
    Zero = 1,
    Repeat = 2,
}

/// How source pixels become tensor values: `(pixel - mean) * normal`
/// per channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageProcessConfig {
    pub filter: Filter,
    pub source_format: ImageFormat,
    pub dest_format: ImageFormat,
    pub mean: [f32; 4],
    pub normal: [f32; 4],
    pub wrap: Wrap,
}

impl Default for ImageProcessConfig {
    fn default() -> Self {
        Self {
            filter: Filter::Nearest,
            source_format: ImageFormat::Rgba,
            dest_format: ImageFormat::Rgba,
            mean: [0.0; 4],
            normal: [1.0; 4],
            wrap: Wrap::ClampToEdge,
        }
    }
}

impl From<&ImageProcessConfig> for RawImageProcessConfig {
    fn from(c: &ImageProcessConfig) -> Self {
        Self {
            filter_type: c.filter as c_int,
            source_format: c.source_format as c_int,
            dest_format: c.dest_format as c_int,
            mean: c.mean,
            normal: c.normal,
            wrap: c.wrap as c_int,
        }
    }
}

#[derive(Debug)]
pub struct ImageProcessor {
    api: Arc<NativeApi>,
    handle: Handle<MnnImageProcess>,
    source_format: ImageFormat,
}

impl ImageProcessor {
    /// `dest` optionally tells the engine the target tensor up front.
    pub fn create(
        api: &Arc<NativeApi>,
        config: &ImageProcessConfig,
        dest: Option<&dyn TensorAccess>,
    ) -> Result<Self> {
        let dest = match dest {
            Some(t) => t.raw()?,
            None => ptr::null_mut(),
        };
        let raw = RawImageProcessConfig::from(config);
        let ptr = pin::scoped(raw, |cfg| unsafe { (api.image_process_create)(cfg, dest) });
        let handle = Handle::from_raw(
            ptr,
            format_args!("{:?} to {:?}", config.source_format, config.dest_format),
        )?;
        debug!(source = ?config.source_format, dest = ?config.dest_format, "image processor created");
        Ok(Self {
            api: Arc::clone(api),
            handle,
            source_format: config.source_format,
        })
    }

    /// Map destination coordinates to source coordinates.
    pub fn set_matrix(&mut self, matrix: &Matrix) -> Result<()> {
        let (p, m) = (self.handle.get()?, matrix.raw()?);
        unsafe { (self.api.image_process_set_matrix)(p, m) };
        Ok(())
    }

    /// Value used for out-of-range samples with [`Wrap::Zero`].
    pub fn set_padding(&mut self, value: u8) -> Result<()> {
        unsafe { (self.api.image_process_set_padding)(self.handle.get()?, value) };
        Ok(())
    }

    /// Convert `width x height` pixels into `dest`. A zero `stride` means
    /// rows are tightly packed.
    pub fn convert(
        &self,
        source: &[u8],
        width: usize,
        height: usize,
        stride: usize,
        dest: &(impl TensorAccess + ?Sized),
    ) -> Result<()> {
        let p = self.handle.get()?;
        let t = dest.raw()?;
        let needed = required_source_len(self.source_format, width, height, stride)?;
        if source.len() < needed {
            return Err(BridgeError::argument(format!(
                "{} source bytes for a {}x{} image needing {}",
                source.len(),
                width,
                height,
                needed
            )));
        }
        let (w, h, s) = (
            c_int::try_from(width),
            c_int::try_from(height),
            c_int::try_from(stride),
        );
        let (Ok(w), Ok(h), Ok(s)) = (w, h, s) else {
            return Err(BridgeError::argument("image dimensions exceed i32"));
        };
        let code = unsafe { (self.api.image_process_convert)(p, source.as_ptr(), w, h, s, t) };
        ErrorCode::check(code, "Image convert")
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    pub fn release(&mut self) {
        if let Some(p) = self.handle.take() {
            unsafe { (self.api.image_process_destroy)(p) };
            debug!("image processor released");
        }
    }
}

/// Bytes a `width x height` image in `format` occupies, rows `stride`
/// bytes apart (zero for tightly packed). Planar YUV 4:2:0 formats follow
/// the luma plane with half as many chroma bytes.
pub fn required_source_len(format: ImageFormat, width: usize, height: usize, stride: usize) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(BridgeError::argument("image has no pixels"));
    }
    let overflow = || {
        BridgeError::argument(format!(
            "{}x{} image with stride {} is too large",
            width, height, stride
        ))
    };
    let pixel_bytes = match format {
        ImageFormat::Nv21 | ImageFormat::Nv12 | ImageFormat::I420 => 1,
        ImageFormat::Bgr555 | ImageFormat::Bgr565 => 2,
        other => other.channels().unwrap_or(1),
    };
    let row = width.checked_mul(pixel_bytes).ok_or_else(overflow)?;
    let stride = if stride == 0 { row } else { stride };
    if stride < row {
        return Err(BridgeError::argument(format!(
            "stride {} shorter than a row of {} bytes",
            stride, row
        )));
    }
    match format {
        ImageFormat::Nv21 | ImageFormat::Nv12 | ImageFormat::I420 => {
            let luma = stride.checked_mul(height).ok_or_else(overflow)?;
            luma.checked_add(luma.div_ceil(2)).ok_or_else(overflow)
        }
        _ => stride
            .checked_mul(height - 1)
            .and_then(|rows| rows.checked_add(row))
            .ok_or_else(overflow),
    }
}

impl Drop for ImageProcessor {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HalideType;
    use crate::tensor::{DimensionType, Tensor};
    use approx::assert_abs_diff_eq;

    fn api() -> Arc<NativeApi> {
        Arc::new(NativeApi::reference())
    }

    #[test]
    fn rgb_to_normalised_nchw() {
        let api = api();
        let config = ImageProcessConfig {
            source_format: ImageFormat::Rgb,
            dest_format: ImageFormat::Bgr,
            mean: [10.0, 20.0, 30.0, 0.0],
            normal: [0.5, 0.5, 0.5, 1.0],
            ..ImageProcessConfig::default()
        };
        let dest = Tensor::host(&api, &[1, 3, 1, 2], HalideType::f32(), DimensionType::Caffe).unwrap();
        let processor = ImageProcessor::create(&api, &config, Some(&dest)).unwrap();
        let pixels = [100u8, 110, 120, 0, 0, 0];
        processor.convert(&pixels, 2, 1, 0, &dest).unwrap();
        let values = dest.read_f32().unwrap();
        // channel-major: B plane, G plane, R plane
        assert_abs_diff_eq!(values[0], (120.0 - 10.0) * 0.5);
        assert_abs_diff_eq!(values[2], (110.0 - 20.0) * 0.5);
        assert_abs_diff_eq!(values[4], (100.0 - 30.0) * 0.5);
        assert_abs_diff_eq!(values[5], (0.0 - 30.0) * 0.5);
    }

    #[test]
    fn matrix_and_padding_apply() {
        let api = api();
        let config = ImageProcessConfig {
            source_format: ImageFormat::Gray,
            dest_format: ImageFormat::Gray,
            wrap: Wrap::Zero,
            ..ImageProcessConfig::default()
        };
        let dest = Tensor::host(&api, &[1, 1, 1, 3], HalideType::f32(), DimensionType::Caffe).unwrap();
        let mut processor = ImageProcessor::create(&api, &config, None).unwrap();
        processor.set_padding(7).unwrap();
        processor
            .set_matrix(&Matrix::translate(&api, 1.0, 0.0).unwrap())
            .unwrap();
        processor.convert(&[1, 2, 3], 3, 1, 0, &dest).unwrap();
        assert_eq!(dest.read_f32().unwrap(), vec![2.0, 3.0, 7.0]);
    }

    #[test]
    fn short_source_is_rejected_before_native_call() {
        let api = api();
        let config = ImageProcessConfig::default();
        let dest = Tensor::host(&api, &[1, 4, 2, 2], HalideType::f32(), DimensionType::Caffe).unwrap();
        let processor = ImageProcessor::create(&api, &config, None).unwrap();
        let err = processor.convert(&[0; 15], 2, 2, 0, &dest).unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentMismatch(_)));
        assert!(processor.convert(&[0; 16], 2, 2, 4, &dest).is_err());
        processor.convert(&[0; 16], 2, 2, 8, &dest).unwrap();
    }

    #[test]
    fn source_lengths_cover_planar_and_16_bit_formats() {
        assert_eq!(required_source_len(ImageFormat::Nv21, 2, 2, 0).unwrap(), 6);
        assert_eq!(required_source_len(ImageFormat::I420, 3, 3, 0).unwrap(), 14);
        assert_eq!(required_source_len(ImageFormat::Nv12, 2, 2, 4).unwrap(), 12);
        assert_eq!(required_source_len(ImageFormat::Bgr565, 3, 2, 0).unwrap(), 12);
        assert_eq!(required_source_len(ImageFormat::Bgr555, 3, 2, 8).unwrap(), 14);
        assert!(required_source_len(ImageFormat::Bgr565, 3, 2, 5).is_err());
        assert!(required_source_len(ImageFormat::Nv21, 0, 2, 0).is_err());
        assert!(matches!(
            required_source_len(ImageFormat::I420, 2, usize::MAX / 2, 4),
            Err(BridgeError::ArgumentMismatch(_))
        ));
    }

    #[test]
    fn huge_stride_is_rejected_without_overflow() {
        let api = api();
        let config = ImageProcessConfig {
            source_format: ImageFormat::Gray,
            dest_format: ImageFormat::Gray,
            ..ImageProcessConfig::default()
        };
        let dest = Tensor::host(&api, &[1, 1, 4, 1], HalideType::f32(), DimensionType::Caffe).unwrap();
        let processor = ImageProcessor::create(&api, &config, None).unwrap();
        let err = processor
            .convert(&[0; 4], 1, 4, usize::MAX / 2, &dest)
            .unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentMismatch(_)));
    }

    #[test]
    fn channel_mismatch_is_an_engine_error() {
        let api = api();
        let config = ImageProcessConfig {
            source_format: ImageFormat::Rgb,
            dest_format: ImageFormat::Rgb,
            ..ImageProcessConfig::default()
        };
        let dest = Tensor::host(&api, &[1, 1, 2, 2], HalideType::f32(), DimensionType::Caffe).unwrap();
        let processor = ImageProcessor::create(&api, &config, None).unwrap();
        let err = processor.convert(&[0; 12], 2, 2, 0, &dest).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::EngineRun {
                code: ErrorCode::InputDataError,
                ..
            }
        ));
    }

    #[test]
    fn unsupported_formats_fail_to_create() {
        let api = api();
        let config = ImageProcessConfig {
            source_format: ImageFormat::Nv21,
            ..ImageProcessConfig::default()
        };
        assert!(matches!(
            ImageProcessor::create(&api, &config, None),
            Err(BridgeError::NativeCreation(_))
        ));
    }
}
