//! ラベルの正規化とラベルマップ
//!
//! 入力された注釈テキストを正規ラベルへ変換し、正規ラベルとクラスインデックスの
//! 双方向対応（`LabelMap`）を管理します。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{RecognizerError, Result};

/// 記号 → 正規ラベルの固定テーブル
const SYMBOL_TABLE: [(&str, &str); 7] = [
    ("*", "mult"),
    ("/", "div"),
    ("+", "plus"),
    ("-", "minus"),
    ("=", "equal"),
    ("÷", "div2"),
    ("x", "mult_x"),
];

/// 生のラベル文字列を正規ラベルに変換する
///
/// - 10進数字のみ: `"num_" + raw`
/// - 記号テーブルに存在: テーブルの値
/// - それ以外: そのまま返す（大文字小文字の統一や空白除去は行わない）
pub fn normalize(raw: &str) -> String {
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        return format!("num_{raw}");
    }

    SYMBOL_TABLE
        .iter()
        .find(|(symbol, _)| *symbol == raw)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// ファイル名に使用できる正規ラベルかどうか（ASCII英数字とアンダースコアのみ）
pub fn is_storable_label(label: &str) -> bool {
    !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 正規ラベル ⇔ クラスインデックス（0..K-1）の全単射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    labels: Vec<String>,
    indices: HashMap<String, usize>,
}

impl LabelMap {
    /// ラベル集合から作成（重複除去のうえ辞書順でインデックスを割り当て）
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sorted: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        Self::from_ordered(sorted.into_iter().collect())
    }

    fn from_ordered(labels: Vec<String>) -> Self {
        let indices = labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.clone(), i))
            .collect();
        Self { labels, indices }
    }

    /// 永続化された index → label の対応から復元
    ///
    /// インデックスが 0 から連続していない場合やラベルが重複している場合はエラー
    pub fn from_index_map(map: BTreeMap<usize, String>) -> Result<Self> {
        if map.is_empty() {
            return Err(RecognizerError::Artifact("label map is empty".into()));
        }

        let mut labels = Vec::with_capacity(map.len());
        for (expected, (index, label)) in map.into_iter().enumerate() {
            if index != expected {
                return Err(RecognizerError::Artifact(format!(
                    "label indices are not contiguous: expected {expected}, found {index}"
                )));
            }
            labels.push(label);
        }

        let unique: BTreeSet<&String> = labels.iter().collect();
        if unique.len() != labels.len() {
            return Err(RecognizerError::Artifact(
                "label map contains duplicate labels".into(),
            ));
        }

        Ok(Self::from_ordered(labels))
    }

    pub fn to_index_map(&self) -> BTreeMap<usize, String> {
        self.labels.iter().cloned().enumerate().collect()
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_index_map())?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let map: BTreeMap<usize, String> = serde_json::from_str(json)?;
        Self::from_index_map(map)
    }

    /// クラス数 K
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.indices.get(label).copied()
    }

    pub fn label_of(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// 長さ K の one-hot ベクトル（学習は整数ターゲットを使うため検証用のみ）
    #[cfg(test)]
    pub(crate) fn one_hot(&self, index: usize) -> Option<Vec<f32>> {
        if index >= self.len() {
            return None;
        }
        let mut vector = vec![0.0; self.len()];
        vector[index] = 1.0;
        Some(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize("7"), "num_7");
        assert_eq!(normalize("42"), "num_42");
        assert_eq!(normalize("*"), "mult");
        assert_eq!(normalize("/"), "div");
        assert_eq!(normalize("+"), "plus");
        assert_eq!(normalize("-"), "minus");
        assert_eq!(normalize("="), "equal");
        assert_eq!(normalize("÷"), "div2");
        assert_eq!(normalize("x"), "mult_x");
        assert_eq!(normalize("plus"), "plus");
    }

    #[test]
    fn test_normalize_identity_fallback_keeps_case_and_whitespace() {
        assert_eq!(normalize("X"), "X");
        assert_eq!(normalize(" + "), " + ");
        assert_eq!(normalize("Plus"), "Plus");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let inputs = [
            "0", "7", "123", "*", "/", "+", "-", "=", "÷", "x", "X", "plus", "num_7", "mult_x",
            "", " ", "7a", "٣", "sqrt",
        ];
        for raw in inputs {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw:?}");
            assert_eq!(normalize(raw), once, "not deterministic for {raw:?}");
        }
    }

    #[test]
    fn test_storable_label() {
        assert!(is_storable_label("num_7"));
        assert!(is_storable_label("mult_x"));
        assert!(!is_storable_label(""));
        assert!(!is_storable_label("a b"));
        assert!(!is_storable_label("÷"));
    }

    #[test]
    fn test_label_map_is_sorted_lexicographically() {
        let map = LabelMap::from_labels(["plus", "plus", "minus"]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.index_of("minus"), Some(0));
        assert_eq!(map.index_of("plus"), Some(1));
        assert_eq!(map.index_of("equal"), None);
    }

    #[test]
    fn test_label_map_round_trip() {
        let map = LabelMap::from_labels(["num_1", "num_10", "div", "mult_x", "equal"]);
        for index in 0..map.len() {
            let label = map.label_of(index).unwrap();
            assert_eq!(map.index_of(label), Some(index));
        }
        assert_eq!(map.label_of(map.len()), None);
    }

    #[test]
    fn test_one_hot_sums_to_one() {
        let map = LabelMap::from_labels(["a", "b", "c"]);
        let v = map.one_hot(1).unwrap();
        assert_eq!(v, vec![0.0, 1.0, 0.0]);
        assert_eq!(v.iter().sum::<f32>(), 1.0);
        assert!(map.one_hot(3).is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let map = LabelMap::from_labels(["plus", "minus", "num_3"]);
        let json = map.to_json_string().unwrap();
        assert!(json.contains("\"0\": \"minus\""));
        let restored = LabelMap::from_json_str(&json).unwrap();
        assert_eq!(restored, map);
    }

    #[test]
    fn test_from_index_map_rejects_gaps_and_duplicates() {
        let gap: BTreeMap<usize, String> =
            [(0, "a".to_string()), (2, "b".to_string())].into_iter().collect();
        assert!(LabelMap::from_index_map(gap).is_err());

        let dup: BTreeMap<usize, String> =
            [(0, "a".to_string()), (1, "a".to_string())].into_iter().collect();
        assert!(LabelMap::from_index_map(dup).is_err());

        assert!(LabelMap::from_index_map(BTreeMap::new()).is_err());
    }
}
