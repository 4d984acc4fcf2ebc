//! 学習用データ拡張
//!
//! 28x28 の画像に対してランダムなアフィン変換（回転・平行移動・せん断・拡大縮小）を
//! サンプルごとに適用します。反転は行いません。
//! 変換で参照元が画像外になった画素は、最も近い縁の画素で埋めます。

use rand::Rng;

use crate::ml::dataset::SymbolItem;
use crate::ml::ml_model::{IMAGE_PIXELS, IMAGE_SIZE};
use crate::model::config::AugmentationSettings;

type Matrix2 = [[f32; 2]; 2];

/// 1サンプル分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    /// 回転角（ラジアン）
    pub rotation: f32,
    /// 行方向の平行移動（画素）
    pub shift_rows: f32,
    /// 列方向の平行移動（画素）
    pub shift_cols: f32,
    /// せん断角（ラジアン）
    pub shear: f32,
    pub zoom_rows: f32,
    pub zoom_cols: f32,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            rotation: 0.0,
            shift_rows: 0.0,
            shift_cols: 0.0,
            shear: 0.0,
            zoom_rows: 1.0,
            zoom_cols: 1.0,
        }
    }

    /// 設定範囲内で一様にパラメータを引く
    pub fn sample<R: Rng + ?Sized>(settings: &AugmentationSettings, rng: &mut R) -> Self {
        let size = IMAGE_SIZE as f32;
        Self {
            rotation: symmetric(rng, settings.rotation_degrees).to_radians(),
            shift_rows: symmetric(rng, settings.height_shift) * size,
            shift_cols: symmetric(rng, settings.width_shift) * size,
            shear: symmetric(rng, settings.shear),
            zoom_rows: 1.0 + symmetric(rng, settings.zoom),
            zoom_cols: 1.0 + symmetric(rng, settings.zoom),
        }
    }

    /// 出力座標の中心からのオフセットを入力座標へ写す行列（回転 · せん断 · 拡大縮小）
    fn matrix(&self) -> Matrix2 {
        let (sin, cos) = self.rotation.sin_cos();
        let rotation = [[cos, -sin], [sin, cos]];
        let shear = [[1.0, -self.shear.sin()], [0.0, self.shear.cos()]];
        let zoom = [[self.zoom_rows, 0.0], [0.0, self.zoom_cols]];
        mul(mul(rotation, shear), zoom)
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, bound: f32) -> f32 {
    let bound = bound.abs();
    if bound == 0.0 {
        0.0
    } else {
        rng.gen_range(-bound..=bound)
    }
}

fn mul(a: Matrix2, b: Matrix2) -> Matrix2 {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}

/// 画像（行優先 784 画素）にアフィン変換を適用する
pub fn apply_affine(src: &[f32], params: &AffineParams) -> Vec<f32> {
    debug_assert_eq!(src.len(), IMAGE_PIXELS);

    let center = (IMAGE_SIZE as f32 - 1.0) / 2.0;
    let m = params.matrix();
    let mut out = Vec::with_capacity(IMAGE_PIXELS);

    for row in 0..IMAGE_SIZE {
        for col in 0..IMAGE_SIZE {
            let dr = row as f32 - center;
            let dc = col as f32 - center;
            let src_row = m[0][0] * dr + m[0][1] * dc + center + params.shift_rows;
            let src_col = m[1][0] * dr + m[1][1] * dc + center + params.shift_cols;
            out.push(sample_bilinear(src, src_row, src_col));
        }
    }
    out
}

/// 双線形補間（範囲外の座標は縁にクランプ）
fn sample_bilinear(src: &[f32], row: f32, col: f32) -> f32 {
    let max = (IMAGE_SIZE - 1) as f32;
    let row = row.clamp(0.0, max);
    let col = col.clamp(0.0, max);

    let r0 = row.floor() as usize;
    let c0 = col.floor() as usize;
    let r1 = (r0 + 1).min(IMAGE_SIZE - 1);
    let c1 = (c0 + 1).min(IMAGE_SIZE - 1);
    let fr = row - r0 as f32;
    let fc = col - c0 as f32;

    let at = |r: usize, c: usize| src[r * IMAGE_SIZE + c];
    let top = at(r0, c0) * (1.0 - fc) + at(r0, c1) * fc;
    let bottom = at(r1, c0) * (1.0 - fc) + at(r1, c1) * fc;
    top * (1.0 - fr) + bottom * fr
}

/// 学習データのみに適用するデータ拡張
#[derive(Debug, Clone)]
pub struct Augmenter {
    settings: AugmentationSettings,
}

impl Augmenter {
    pub fn new(settings: AugmentationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AugmentationSettings {
        &self.settings
    }

    /// バッチ内の各サンプルに独立したランダム変換を適用する（ラベルは変更しない）
    pub fn augment_batch<R: Rng + ?Sized>(
        &self,
        items: Vec<SymbolItem>,
        rng: &mut R,
    ) -> Vec<SymbolItem> {
        items
            .into_iter()
            .map(|item| {
                let params = AffineParams::sample(&self.settings, rng);
                SymbolItem {
                    pixels: apply_affine(&item.pixels, &params),
                    label: item.label,
                }
            })
            .collect()
    }
}
