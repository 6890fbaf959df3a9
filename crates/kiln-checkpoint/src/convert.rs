//! Parameter-name remapping between the internal and external schemes.
//!
//! A [`ConversionTable`] is an ordered list of [`KeyRule`]s. Templates are
//! dotted parameter paths where `{}` stands for a block index. A template
//! matches the path itself or the path followed by a dotted suffix such as
//! `.weight`, and the suffix is carried over to the converted name.
//!
//! # Examples
//!
//! ```
//! use kiln_checkpoint::KeyConverter;
//! use kiln_tensor::{DType, Tensor, TensorMap};
//!
//! let converter = KeyConverter::pixart_alpha();
//!
//! let mut internal = TensorMap::new();
//! for proj in ["to_q", "to_k", "to_v"] {
//!     internal.insert(
//!         format!("transformer_blocks.0.attn1.{proj}.weight"),
//!         Tensor::zeros(DType::F32, &[8, 8]),
//!     );
//! }
//!
//! let external = converter.to_external(&internal).unwrap();
//! assert_eq!(external["blocks.0.attn.qkv.weight"].dims(), &[24, 8]);
//! assert_eq!(converter.to_internal(&external).unwrap(), internal);
//! ```

use crate::{CheckpointError, Result};
use kiln_tensor::{Tensor, TensorMap};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// A single naming rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRule {
    /// One internal tensor maps to one external tensor.
    Rename {
        /// Internal template.
        internal: &'static str,
        /// External template.
        external: &'static str,
    },
    /// Several internal tensors are concatenated along `axis` into one
    /// external tensor. Converting back splits it into equal parts.
    Concat {
        /// Internal templates, in concatenation order.
        internal: &'static [&'static str],
        /// External template.
        external: &'static str,
        /// Concatenation axis.
        axis: usize,
    },
}

/// A template compiled to an anchored regex.
#[derive(Debug, Clone)]
struct Template {
    source: &'static str,
    pattern: Regex,
    slots: usize,
}

impl Template {
    fn compile(source: &'static str) -> Result<Self> {
        let pieces: Vec<String> = source.split("{}").map(regex::escape).collect();
        let body = pieces.join(r"(\d+)");
        let pattern = Regex::new(&format!(r"^{}(\..+)?$", body)).map_err(|e| {
            CheckpointError::InvalidConfig(format!("bad key template {:?}: {}", source, e))
        })?;
        Ok(Self {
            source,
            pattern,
            slots: pieces.len() - 1,
        })
    }

    /// Returns the block indices and suffix if `key` matches.
    fn captures(&self, key: &str) -> Option<Match> {
        let caps = self.pattern.captures(key)?;
        let indices = (1..=self.slots)
            .filter_map(|i| caps.get(i).map(|m| m.as_str().to_string()))
            .collect();
        let suffix = caps
            .get(self.slots + 1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        Some(Match { indices, suffix })
    }

    /// Fills the `{}` slots with `m.indices` and appends the suffix.
    fn render(&self, m: &Match) -> String {
        let mut out = String::with_capacity(self.source.len() + m.suffix.len());
        let mut indices = m.indices.iter();
        let mut pieces = self.source.split("{}").peekable();
        while let Some(piece) = pieces.next() {
            out.push_str(piece);
            if pieces.peek().is_some() {
                if let Some(index) = indices.next() {
                    out.push_str(index);
                }
            }
        }
        out.push_str(&m.suffix);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Match {
    indices: Vec<String>,
    suffix: String,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: KeyRule,
    internal: Vec<Template>,
    external: Template,
}

impl CompiledRule {
    fn axis(&self) -> usize {
        match self.rule {
            KeyRule::Rename { .. } => 0,
            KeyRule::Concat { axis, .. } => axis,
        }
    }

    fn is_concat(&self) -> bool {
        matches!(self.rule, KeyRule::Concat { .. })
    }
}

/// An ordered set of naming rules for one model family.
#[derive(Debug, Clone)]
pub struct ConversionTable {
    name: &'static str,
    rules: Vec<CompiledRule>,
    passthrough: bool,
}

impl ConversionTable {
    /// Compiles a table. The first matching rule wins.
    pub fn new(name: &'static str, rules: &[KeyRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let (internal, external) = match *rule {
                    KeyRule::Rename { internal, external } => (vec![internal], external),
                    KeyRule::Concat {
                        internal, external, ..
                    } => (internal.to_vec(), external),
                };
                if internal.is_empty() {
                    return Err(CheckpointError::InvalidConfig(format!(
                        "rule for {:?} has no internal templates",
                        external
                    )));
                }
                Ok(CompiledRule {
                    rule: *rule,
                    internal: internal
                        .into_iter()
                        .map(Template::compile)
                        .collect::<Result<_>>()?,
                    external: Template::compile(external)?,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            name,
            rules,
            passthrough: false,
        })
    }

    /// A table that keeps every name unchanged.
    pub fn passthrough() -> Self {
        Self {
            name: "passthrough",
            rules: Vec::new(),
            passthrough: true,
        }
    }

    /// Table mapping the diffusers PixArt-Alpha transformer to the original
    /// PixArt checkpoint naming.
    pub fn pixart_alpha() -> &'static ConversionTable {
        &PIXART_ALPHA
    }

    /// Name of the table.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn find_internal(&self, key: &str) -> Option<(usize, usize, Match)> {
        self.rules.iter().enumerate().find_map(|(r, rule)| {
            rule.internal
                .iter()
                .enumerate()
                .find_map(|(part, t)| t.captures(key).map(|m| (r, part, m)))
        })
    }

    fn find_external(&self, key: &str) -> Option<(usize, Match)> {
        self.rules
            .iter()
            .enumerate()
            .find_map(|(r, rule)| rule.external.captures(key).map(|m| (r, m)))
    }
}

/// Converts tensor maps between the internal and external naming schemes.
#[derive(Debug, Clone, Copy)]
pub struct KeyConverter<'a> {
    table: &'a ConversionTable,
}

impl<'a> KeyConverter<'a> {
    /// Create a converter over `table`.
    pub fn new(table: &'a ConversionTable) -> Self {
        Self { table }
    }

    /// The table this converter uses.
    pub fn table(&self) -> &'a ConversionTable {
        self.table
    }

    /// Renames internal keys to external keys, fusing concat groups.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::UnknownKey`] if no rule matches a key
    /// - [`CheckpointError::MissingKey`] if a concat group is incomplete
    /// - [`CheckpointError::ShapeMismatch`] if the parts of a group differ in
    ///   shape or dtype
    pub fn to_external(&self, internal: &TensorMap) -> Result<TensorMap> {
        let mut out = TensorMap::new();
        // (rule, indices + suffix) -> parts by position
        let mut groups: BTreeMap<(usize, Match), BTreeMap<usize, &Tensor>> = BTreeMap::new();

        for (key, tensor) in internal {
            if self.table.passthrough {
                insert_unique(&mut out, key.clone(), tensor.clone())?;
                continue;
            }
            let (r, part, m) = self
                .table
                .find_internal(key)
                .ok_or_else(|| CheckpointError::UnknownKey(key.clone()))?;
            let rule = &self.table.rules[r];
            if rule.is_concat() {
                groups.entry((r, m)).or_default().insert(part, tensor);
            } else {
                insert_unique(&mut out, rule.external.render(&m), tensor.clone())?;
            }
        }

        for ((r, m), parts) in groups {
            let rule = &self.table.rules[r];
            let external = rule.external.render(&m);
            if let Some(missing) = (0..rule.internal.len()).find(|i| !parts.contains_key(i)) {
                return Err(CheckpointError::MissingKey(rule.internal[missing].render(&m)));
            }
            let parts: Vec<&Tensor> = parts.into_values().collect();
            let first = parts[0];
            if let Some(odd) = parts
                .iter()
                .position(|t| t.dims() != first.dims() || t.dtype() != first.dtype())
            {
                return Err(CheckpointError::ShapeMismatch {
                    key: rule.internal[odd].render(&m),
                    detail: format!(
                        "{} {} does not match {} {} of {}",
                        parts[odd].dtype(),
                        parts[odd].shape(),
                        first.dtype(),
                        first.shape(),
                        rule.internal[0].render(&m)
                    ),
                });
            }
            let fused = Tensor::concat(&parts, rule.axis()).map_err(|e| {
                CheckpointError::ShapeMismatch {
                    key: external.clone(),
                    detail: e.to_string(),
                }
            })?;
            insert_unique(&mut out, external, fused)?;
        }

        tracing::debug!(
            table = self.table.name,
            input = internal.len(),
            output = out.len(),
            "Converted to external naming"
        );
        Ok(out)
    }

    /// Renames external keys to internal keys, splitting fused tensors.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::UnknownKey`] if no rule matches a key
    /// - [`CheckpointError::ShapeMismatch`] if a fused tensor cannot be split
    ///   into equal parts
    pub fn to_internal(&self, external: &TensorMap) -> Result<TensorMap> {
        let mut out = TensorMap::new();
        for (key, tensor) in external {
            if self.table.passthrough {
                insert_unique(&mut out, key.clone(), tensor.clone())?;
                continue;
            }
            let (r, m) = self
                .table
                .find_external(key)
                .ok_or_else(|| CheckpointError::UnknownKey(key.clone()))?;
            let rule = &self.table.rules[r];
            if !rule.is_concat() {
                insert_unique(&mut out, rule.internal[0].render(&m), tensor.clone())?;
                continue;
            }
            let pieces = tensor
                .split_even(rule.axis(), rule.internal.len())
                .map_err(|e| CheckpointError::ShapeMismatch {
                    key: key.clone(),
                    detail: e.to_string(),
                })?;
            for (template, piece) in rule.internal.iter().zip(pieces) {
                insert_unique(&mut out, template.render(&m), piece)?;
            }
        }
        tracing::debug!(
            table = self.table.name,
            input = external.len(),
            output = out.len(),
            "Converted to internal naming"
        );
        Ok(out)
    }
}

impl KeyConverter<'static> {
    /// Converter for the PixArt-Alpha transformer.
    pub fn pixart_alpha() -> Self {
        Self::new(ConversionTable::pixart_alpha())
    }
}

fn insert_unique(out: &mut TensorMap, key: String, tensor: Tensor) -> Result<()> {
    if out.contains_key(&key) {
        return Err(CheckpointError::InvalidConfig(format!(
            "two parameters convert to {}",
            key
        )));
    }
    out.insert(key, tensor);
    Ok(())
}

const PIXART_ALPHA_RULES: &[KeyRule] = &[
    KeyRule::Rename {
        internal: "pos_embed.proj",
        external: "x_embedder.proj",
    },
    KeyRule::Rename {
        internal: "adaln_single.emb.timestep_embedder.linear_1",
        external: "t_embedder.mlp.0",
    },
    KeyRule::Rename {
        internal: "adaln_single.emb.timestep_embedder.linear_2",
        external: "t_embedder.mlp.2",
    },
    KeyRule::Rename {
        internal: "adaln_single.emb.resolution_embedder.linear_1",
        external: "csize_embedder.mlp.0",
    },
    KeyRule::Rename {
        internal: "adaln_single.emb.resolution_embedder.linear_2",
        external: "csize_embedder.mlp.2",
    },
    KeyRule::Rename {
        internal: "adaln_single.emb.aspect_ratio_embedder.linear_1",
        external: "ar_embedder.mlp.0",
    },
    KeyRule::Rename {
        internal: "adaln_single.emb.aspect_ratio_embedder.linear_2",
        external: "ar_embedder.mlp.2",
    },
    KeyRule::Rename {
        internal: "adaln_single.linear",
        external: "t_block.1",
    },
    KeyRule::Rename {
        internal: "caption_projection.linear_1",
        external: "y_embedder.y_proj.fc1",
    },
    KeyRule::Rename {
        internal: "caption_projection.linear_2",
        external: "y_embedder.y_proj.fc2",
    },
    KeyRule::Rename {
        internal: "transformer_blocks.{}.scale_shift_table",
        external: "blocks.{}.scale_shift_table",
    },
    KeyRule::Concat {
        internal: &[
            "transformer_blocks.{}.attn1.to_q",
            "transformer_blocks.{}.attn1.to_k",
            "transformer_blocks.{}.attn1.to_v",
        ],
        external: "blocks.{}.attn.qkv",
        axis: 0,
    },
    KeyRule::Rename {
        internal: "transformer_blocks.{}.attn1.to_out.0",
        external: "blocks.{}.attn.proj",
    },
    KeyRule::Rename {
        internal: "transformer_blocks.{}.attn2.to_q",
        external: "blocks.{}.cross_attn.q_linear",
    },
    KeyRule::Concat {
        internal: &[
            "transformer_blocks.{}.attn2.to_k",
            "transformer_blocks.{}.attn2.to_v",
        ],
        external: "blocks.{}.cross_attn.kv_linear",
        axis: 0,
    },
    KeyRule::Rename {
        internal: "transformer_blocks.{}.attn2.to_out.0",
        external: "blocks.{}.cross_attn.proj",
    },
    KeyRule::Rename {
        internal: "transformer_blocks.{}.ff.net.0.proj",
        external: "blocks.{}.mlp.fc1",
    },
    KeyRule::Rename {
        internal: "transformer_blocks.{}.ff.net.2",
        external: "blocks.{}.mlp.fc2",
    },
    KeyRule::Rename {
        internal: "proj_out",
        external: "final_layer.linear",
    },
    KeyRule::Rename {
        internal: "scale_shift_table",
        external: "final_layer.scale_shift_table",
    },
];

static PIXART_ALPHA: Lazy<ConversionTable> = Lazy::new(|| {
    ConversionTable::new("pixart_alpha", PIXART_ALPHA_RULES).expect("valid PixArt-Alpha table")
});

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_tensor::DType;

    fn seq(n: usize, offset: f32, shape: &[usize]) -> Tensor {
        Tensor::from_vec((0..n).map(|v| v as f32 + offset).collect::<Vec<_>>(), shape).unwrap()
    }

    fn internal_block(map: &mut TensorMap, block: usize, hidden: usize) {
        let prefix = format!("transformer_blocks.{block}");
        let mut k = 0.0;
        let mut next = |shape: &[usize]| {
            k += 1000.0;
            seq(shape.iter().product(), k, shape)
        };
        for attn in ["attn1", "attn2"] {
            for proj in ["to_q", "to_k", "to_v"] {
                map.insert(format!("{prefix}.{attn}.{proj}.weight"), next(&[hidden, hidden]));
                map.insert(format!("{prefix}.{attn}.{proj}.bias"), next(&[hidden]));
            }
            map.insert(format!("{prefix}.{attn}.to_out.0.weight"), next(&[hidden, hidden]));
            map.insert(format!("{prefix}.{attn}.to_out.0.bias"), next(&[hidden]));
        }
        map.insert(format!("{prefix}.ff.net.0.proj.weight"), next(&[hidden * 4, hidden]));
        map.insert(format!("{prefix}.ff.net.2.weight"), next(&[hidden, hidden * 4]));
        map.insert(format!("{prefix}.scale_shift_table"), next(&[6, hidden]));
    }

    fn internal_model() -> TensorMap {
        let mut map = TensorMap::new();
        map.insert("pos_embed.proj.weight", seq(8, 0.5, &[2, 4]));
        map.insert("pos_embed.proj.bias", seq(2, 0.25, &[2]));
        map.insert("adaln_single.linear.weight", seq(12, 1.0, &[12, 1]));
        map.insert("caption_projection.linear_1.weight", seq(4, 2.0, &[2, 2]));
        map.insert("proj_out.weight", seq(4, 3.0, &[4, 1]));
        map.insert("scale_shift_table", seq(4, 4.0, &[2, 2]));
        for block in [0, 1, 11] {
            internal_block(&mut map, block, 4);
        }
        map
    }

    #[test]
    fn test_pixart_round_trip_is_bit_exact() {
        let converter = KeyConverter::pixart_alpha();
        let internal = internal_model();
        let external = converter.to_external(&internal).unwrap();

        assert!(external.contains_key("x_embedder.proj.weight"));
        assert!(external.contains_key("t_block.1.weight"));
        assert!(external.contains_key("final_layer.linear.weight"));
        assert!(external.contains_key("final_layer.scale_shift_table"));
        assert!(external.contains_key("blocks.11.scale_shift_table"));
        assert!(external.contains_key("blocks.1.cross_attn.q_linear.bias"));
        assert!(!external.keys().any(|k| k.contains("transformer_blocks")));
        assert_eq!(external["blocks.0.attn.qkv.weight"].dims(), &[12, 4]);
        assert_eq!(external["blocks.0.attn.qkv.bias"].dims(), &[12]);
        assert_eq!(external["blocks.11.cross_attn.kv_linear.weight"].dims(), &[8, 4]);
        // 3 fused to 1 for self-attention, 2 to 1 for cross-attention, per tensor kind
        assert_eq!(external.len(), internal.len() - 3 * (2 + 1) * 2);

        let back = converter.to_internal(&external).unwrap();
        assert_eq!(back, internal);
    }

    #[test]
    fn test_concat_order() {
        let mut internal = TensorMap::new();
        internal.insert("transformer_blocks.0.attn1.to_q.bias", seq(2, 0.0, &[2]));
        internal.insert("transformer_blocks.0.attn1.to_k.bias", seq(2, 10.0, &[2]));
        internal.insert("transformer_blocks.0.attn1.to_v.bias", seq(2, 20.0, &[2]));

        let external = KeyConverter::pixart_alpha().to_external(&internal).unwrap();
        assert_eq!(
            external["blocks.0.attn.qkv.bias"].to_f64_vec(),
            vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0]
        );
    }

    #[test]
    fn test_unknown_key() {
        let mut internal = TensorMap::new();
        internal.insert("not_a_layer.weight", seq(1, 0.0, &[1]));
        let err = KeyConverter::pixart_alpha()
            .to_external(&internal)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownKey(key) if key == "not_a_layer.weight"));

        // A template only matches whole path segments.
        let mut internal = TensorMap::new();
        internal.insert("proj_out_extra.weight", seq(1, 0.0, &[1]));
        assert!(matches!(
            KeyConverter::pixart_alpha().to_external(&internal),
            Err(CheckpointError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_incomplete_group() {
        let mut internal = TensorMap::new();
        internal.insert("transformer_blocks.3.attn2.to_k.weight", seq(4, 0.0, &[2, 2]));
        let err = KeyConverter::pixart_alpha()
            .to_external(&internal)
            .unwrap_err();
        assert!(
            matches!(&err, CheckpointError::MissingKey(key) if key == "transformer_blocks.3.attn2.to_v.weight"),
            "{err:?}"
        );
    }

    #[test]
    fn test_group_shape_mismatch() {
        let mut internal = TensorMap::new();
        internal.insert("transformer_blocks.0.attn2.to_k.weight", seq(4, 0.0, &[2, 2]));
        internal.insert("transformer_blocks.0.attn2.to_v.weight", seq(6, 0.0, &[3, 2]));
        let err = KeyConverter::pixart_alpha()
            .to_external(&internal)
            .unwrap_err();
        assert!(
            matches!(&err, CheckpointError::ShapeMismatch { key, .. } if key == "transformer_blocks.0.attn2.to_v.weight"),
            "{err:?}"
        );

        let mut internal = TensorMap::new();
        internal.insert("transformer_blocks.0.attn2.to_k.weight", seq(4, 0.0, &[2, 2]));
        internal.insert(
            "transformer_blocks.0.attn2.to_v.weight",
            seq(4, 0.0, &[2, 2]).cast(DType::F16).unwrap(),
        );
        assert!(matches!(
            KeyConverter::pixart_alpha().to_external(&internal),
            Err(CheckpointError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_split_requires_divisible_axis() {
        let mut external = TensorMap::new();
        external.insert("blocks.0.attn.qkv.weight", seq(8, 0.0, &[4, 2]));
        let err = KeyConverter::pixart_alpha()
            .to_internal(&external)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::ShapeMismatch { key, .. } if key == "blocks.0.attn.qkv.weight"));
    }

    #[test]
    fn test_passthrough() {
        let table = ConversionTable::passthrough();
        let converter = KeyConverter::new(&table);
        let mut map = TensorMap::new();
        map.insert("anything.at.all", seq(3, 0.0, &[3]));
        assert_eq!(converter.to_external(&map).unwrap(), map);
        assert_eq!(converter.to_internal(&map).unwrap(), map);
        assert!(table.is_empty());
    }

    #[test]
    fn test_template_render() {
        let template = Template::compile("blocks.{}.attn.qkv").unwrap();
        let m = template.captures("blocks.27.attn.qkv.weight").unwrap();
        assert_eq!(m.indices, vec!["27"]);
        assert_eq!(m.suffix, ".weight");
        assert_eq!(template.render(&m), "blocks.27.attn.qkv.weight");
        assert!(template.captures("blocks.x.attn.qkv").is_none());
    }

    #[test]
    fn test_table_rejects_empty_concat() {
        let rules = [KeyRule::Concat {
            internal: &[],
            external: "fused",
            axis: 0,
        }];
        assert!(matches!(
            ConversionTable::new("broken", &rules),
            Err(CheckpointError::InvalidConfig(_))
        ));
        assert_eq!(ConversionTable::pixart_alpha().len(), PIXART_ALPHA_RULES.len());
    }
}
