//! Reference `MNN_Matrix_*` and `MNN_ImageProcess_*` entry points.
//!
//! Matrices are nine row-major floats:
//! `[scale_x, skew_x, trans_x, skew_y, scale_y, trans_y, persp0, persp1, persp2]`.

use std::os::raw::c_int;
use std::ptr;

use crate::ffi::{MnnImageProcess, MnnMatrix, MnnTensor, RawImageProcessConfig, RawRect};

use super::status;
use super::tensor::tensor;

type M9 = [f32; 9];

const IDENTITY: M9 = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

unsafe fn matrix<'a>(m: *const MnnMatrix) -> Option<&'a mut M9> {
    (m as *mut M9).as_mut()
}

fn publish(values: M9) -> *mut MnnMatrix {
    Box::into_raw(Box::new(values)) as *mut MnnMatrix
}

fn multiply(a: &M9, b: &M9) -> M9 {
    let mut out = [0.0; 9];
    for row in 0..3 {
        for col in 0..3 {
            out[row * 3 + col] = (0..3).map(|k| a[row * 3 + k] * b[k * 3 + col]).sum();
        }
    }
    out
}

fn map_point(m: &M9, x: f32, y: f32) -> (f32, f32) {
    let w = m[6] * x + m[7] * y + m[8];
    let w = if w == 0.0 { 1.0 } else { w };
    (
        (m[0] * x + m[1] * y + m[2]) / w,
        (m[3] * x + m[4] * y + m[5]) / w,
    )
}

pub unsafe extern "C" fn matrix_create() -> *mut MnnMatrix {
    publish(IDENTITY)
}

pub unsafe extern "C" fn matrix_make_scale(sx: f32, sy: f32) -> *mut MnnMatrix {
    publish([sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0])
}

pub unsafe extern "C" fn matrix_make_trans(dx: f32, dy: f32) -> *mut MnnMatrix {
    publish([1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0])
}

pub unsafe extern "C" fn matrix_destroy(m: *mut MnnMatrix) {
    if !m.is_null() {
        drop(Box::from_raw(m as *mut M9));
    }
}

pub unsafe extern "C" fn matrix_is_identity(m: *const MnnMatrix) -> bool {
    matrix(m).is_some_and(|m| *m == IDENTITY)
}

pub unsafe extern "C" fn matrix_get(m: *const MnnMatrix, index: c_int) -> f32 {
    match (matrix(m), usize::try_from(index)) {
        (Some(m), Ok(i)) if i < 9 => m[i],
        _ => 0.0,
    }
}

pub unsafe extern "C" fn matrix_set(m: *mut MnnMatrix, index: c_int, value: f32) {
    if let (Some(m), Ok(i)) = (matrix(m), usize::try_from(index)) {
        if i < 9 {
            m[i] = value;
        }
    }
}

pub unsafe extern "C" fn matrix_get9(m: *const MnnMatrix, out: *mut f32) {
    if let (Some(m), false) = (matrix(m), out.is_null()) {
        ptr::copy_nonoverlapping(m.as_ptr(), out, 9);
    }
}

pub unsafe extern "C" fn matrix_set9(m: *mut MnnMatrix, values: *const f32) {
    if let (Some(m), false) = (matrix(m), values.is_null()) {
        ptr::copy_nonoverlapping(values, m.as_mut_ptr(), 9);
    }
}

pub unsafe extern "C" fn matrix_reset(m: *mut MnnMatrix) {
    if let Some(m) = matrix(m) {
        *m = IDENTITY;
    }
}

pub unsafe extern "C" fn matrix_set_translate(m: *mut MnnMatrix, dx: f32, dy: f32) {
    if let Some(m) = matrix(m) {
        *m = [1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0];
    }
}

pub unsafe extern "C" fn matrix_set_scale(m: *mut MnnMatrix, sx: f32, sy: f32) {
    if let Some(m) = matrix(m) {
        *m = [sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0];
    }
}

pub unsafe extern "C" fn matrix_set_rotate(m: *mut MnnMatrix, degrees: f32) {
    if let Some(m) = matrix(m) {
        let (sin, cos) = degrees.to_radians().sin_cos();
        *m = [cos, -sin, 0.0, sin, cos, 0.0, 0.0, 0.0, 1.0];
    }
}

pub unsafe extern "C" fn matrix_pre_concat(m: *mut MnnMatrix, other: *const MnnMatrix) {
    if let (Some(other), Some(m)) = (matrix(other).map(|o| *o), matrix(m)) {
        *m = multiply(m, &other);
    }
}

pub unsafe extern "C" fn matrix_post_concat(m: *mut MnnMatrix, other: *const MnnMatrix) {
    if let (Some(other), Some(m)) = (matrix(other).map(|o| *o), matrix(m)) {
        *m = multiply(&other, m);
    }
}

pub unsafe extern "C" fn matrix_invert(m: *const MnnMatrix, inverse: *mut MnnMatrix) -> bool {
    let Some(a) = matrix(m).map(|m| *m) else {
        return false;
    };
    let Some(out) = matrix(inverse) else {
        return false;
    };
    let cofactor = |r0: usize, r1: usize, c0: usize, c1: usize| {
        a[r0 * 3 + c0] * a[r1 * 3 + c1] - a[r0 * 3 + c1] * a[r1 * 3 + c0]
    };
    let c00 = cofactor(1, 2, 1, 2);
    let c01 = -cofactor(1, 2, 0, 2);
    let c02 = cofactor(1, 2, 0, 1);
    let det = a[0] * c00 + a[1] * c01 + a[2] * c02;
    if det.abs() <= f32::EPSILON * f32::EPSILON || !det.is_finite() {
        return false;
    }
    let adjugate = [
        c00,
        -cofactor(0, 2, 1, 2),
        cofactor(0, 1, 1, 2),
        c01,
        cofactor(0, 2, 0, 2),
        -cofactor(0, 1, 0, 2),
        c02,
        -cofactor(0, 2, 0, 1),
        cofactor(0, 1, 0, 1),
    ];
    *out = adjugate.map(|v| v / det);
    true
}

/// Returns whether the mapped rectangle is still axis aligned.
pub unsafe extern "C" fn matrix_map_rect(
    m: *const MnnMatrix,
    dst: *mut RawRect,
    src: *const RawRect,
) -> bool {
    let (Some(m), Some(dst), Some(src)) = (matrix(m), dst.as_mut(), src.as_ref()) else {
        return false;
    };
    let corners = [
        map_point(m, src.left, src.top),
        map_point(m, src.right, src.top),
        map_point(m, src.right, src.bottom),
        map_point(m, src.left, src.bottom),
    ];
    let xs = corners.map(|(x, _)| x);
    let ys = corners.map(|(_, y)| y);
    *dst = RawRect {
        left: xs.iter().copied().fold(f32::INFINITY, f32::min),
        top: ys.iter().copied().fold(f32::INFINITY, f32::min),
        right: xs.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        bottom: ys.iter().copied().fold(f32::NEG_INFINITY, f32::max),
    };
    (m[1] == 0.0 && m[3] == 0.0) || (m[0] == 0.0 && m[4] == 0.0)
}

struct RefImageProcess {
    config: RawImageProcessConfig,
    matrix: M9,
    padding: u8,
}

unsafe fn process<'a>(p: *const MnnImageProcess) -> Option<&'a mut RefImageProcess> {
    (p as *mut RefImageProcess).as_mut()
}

fn channels(format: c_int) -> Option<usize> {
    match format {
        0 | 4 => Some(4), // RGBA, BGRA
        1 | 2 => Some(3), // RGB, BGR
        3 => Some(1),     // GRAY
        _ => None,
    }
}

/// Decode one source pixel into RGBA.
fn to_rgba(format: c_int, px: &[u8]) -> [f32; 4] {
    let f = |i: usize| f32::from(px[i]);
    match format {
        0 => [f(0), f(1), f(2), f(3)],
        1 => [f(0), f(1), f(2), 255.0],
        2 => [f(2), f(1), f(0), 255.0],
        3 => [f(0), f(0), f(0), 255.0],
        _ => [f(2), f(1), f(0), f(3)],
    }
}

fn from_rgba(format: c_int, rgba: [f32; 4]) -> ([f32; 4], usize) {
    let [r, g, b, a] = rgba;
    match format {
        0 => ([r, g, b, a], 4),
        1 => ([r, g, b, 0.0], 3),
        2 => ([b, g, r, 0.0], 3),
        3 if r == g && g == b => ([r, 0.0, 0.0, 0.0], 1),
        3 => ([0.299 * r + 0.587 * g + 0.114 * b, 0.0, 0.0, 0.0], 1),
        _ => ([b, g, r, a], 4),
    }
}

pub unsafe extern "C" fn image_process_create(
    config: *const RawImageProcessConfig,
    _dst: *const MnnTensor,
) -> *mut MnnImageProcess {
    let Some(config) = config.as_ref() else {
        return ptr::null_mut();
    };
    if channels(config.source_format).is_none()
        || channels(config.dest_format).is_none()
        || !(0..=2).contains(&config.filter_type)
        || !(0..=2).contains(&config.wrap)
    {
        return ptr::null_mut();
    }
    Box::into_raw(Box::new(RefImageProcess {
        config: *config,
        matrix: IDENTITY,
        padding: 0,
    })) as *mut MnnImageProcess
}

pub unsafe extern "C" fn image_process_destroy(p: *mut MnnImageProcess) {
    if !p.is_null() {
        drop(Box::from_raw(p as *mut RefImageProcess));
    }
}

pub unsafe extern "C" fn image_process_set_matrix(p: *mut MnnImageProcess, m: *const MnnMatrix) {
    if let (Some(p), Some(m)) = (process(p), matrix(m)) {
        p.matrix = *m;
    }
}

pub unsafe extern "C" fn image_process_set_padding(p: *mut MnnImageProcess, value: u8) {
    if let Some(p) = process(p) {
        p.padding = value;
    }
}

/// Nearest-neighbour sampling through the process matrix (destination to
/// source), then mean/normal scaling. Writes batch 0 of `dest`.
pub unsafe extern "C" fn image_process_convert(
    p: *const MnnImageProcess,
    source: *const u8,
    iw: c_int,
    ih: c_int,
    stride: c_int,
    dest: *mut MnnTensor,
) -> c_int {
    let (Some(p), Some(dest), false) = (process(p), tensor(dest), source.is_null()) else {
        return status::INVALID_VALUE;
    };
    if iw <= 0 || ih <= 0 || stride < 0 {
        return status::INVALID_VALUE;
    }
    let cfg = &p.config;
    let (Some(src_c), Some(dst_c)) = (channels(cfg.source_format), channels(cfg.dest_format))
    else {
        return status::NOT_SUPPORT;
    };
    let (iw, ih) = (iw as usize, ih as usize);
    let stride = if stride == 0 { iw * src_c } else { stride as usize };
    let src = std::slice::from_raw_parts(source, stride * (ih - 1) + iw * src_c);

    let mut state = dest.lock();
    if state.shape.len() != 4 {
        return status::INPUT_DATA_ERROR;
    }
    // TENSORFLOW is NHWC, both CAFFE layouts are treated as NCHW here.
    let nhwc = state.dim_type == 0;
    let (c, h, w) = if nhwc {
        (state.shape[3], state.shape[1], state.shape[2])
    } else {
        (state.shape[1], state.shape[2], state.shape[3])
    };
    let (c, h, w) = (c.max(0) as usize, h.max(0) as usize, w.max(0) as usize);
    if c != dst_c {
        return status::INPUT_DATA_ERROR;
    }
    let float_out = state.is_f32();
    if !float_out && !(state.ty.code == 1 && state.ty.bits == 8) {
        return status::NOT_SUPPORT;
    }

    let mut values = vec![0f32; c * h * w];
    for y in 0..h {
        for x in 0..w {
            let (sx, sy) = map_point(&p.matrix, x as f32, y as f32);
            let (sx, sy) = (sx.round() as i64, sy.round() as i64);
            let inside = sx >= 0 && sy >= 0 && (sx as usize) < iw && (sy as usize) < ih;
            let rgba = match (cfg.wrap, inside) {
                (_, true) => sample(cfg.source_format, src, stride, src_c, sx as usize, sy as usize),
                (1, false) => [f32::from(p.padding); 4],
                (2, false) => sample(
                    cfg.source_format,
                    src,
                    stride,
                    src_c,
                    sx.rem_euclid(iw as i64) as usize,
                    sy.rem_euclid(ih as i64) as usize,
                ),
                _ => sample(
                    cfg.source_format,
                    src,
                    stride,
                    src_c,
                    sx.clamp(0, iw as i64 - 1) as usize,
                    sy.clamp(0, ih as i64 - 1) as usize,
                ),
            };
            let (pixel, n) = from_rgba(cfg.dest_format, rgba);
            for ch in 0..n {
                let v = (pixel[ch] - cfg.mean[ch]) * cfg.normal[ch];
                let index = if nhwc {
                    (y * w + x) * c + ch
                } else {
                    ch * h * w + y * w + x
                };
                values[index] = v;
            }
        }
    }

    let bytes = state.data.as_bytes_mut();
    if float_out {
        for (chunk, v) in bytes.chunks_exact_mut(4).zip(&values) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
    } else {
        for (byte, v) in bytes.iter_mut().zip(&values) {
            *byte = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    status::NO_ERROR
}

fn sample(format: c_int, src: &[u8], stride: usize, src_c: usize, x: usize, y: usize) -> [f32; 4] {
    let offset = y * stride + x * src_c;
    to_rgba(format, &src[offset..offset + src_c])
}
