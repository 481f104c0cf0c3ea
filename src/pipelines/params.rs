//! Parameter grouping for differential optimization.
//!
//! Pure classification over parameter names: membership is decided once at
//! construction by substring matching and handed to the external optimizer.
//! Nothing here touches tensors.

use std::collections::BTreeMap;

/// Named partition of the denoiser's parameter names.
pub type ParameterGroups = BTreeMap<&'static str, Vec<String>>;

/// True for parameters inside a transformer block of a single-path backbone.
pub fn is_transformer_block_param(name: &str) -> bool {
    name.contains("transformer_blocks")
}

/// True for parameters of the second attention path of a dual-cross-attention
/// backbone, where each attention module holds its paths in a two-element
/// list and index 1 is the added path.
pub fn is_dual_attn_transformer_param(name: &str) -> bool {
    [".1.norm", ".1.proj_in", ".1.transformer_blocks", ".1.proj_out"]
        .iter()
        .any(|marker| name.contains(marker))
}

/// Splits parameters into `transformers` and `other`, for training schedules
/// that tune the attention stack at a different rate.
pub fn transformer_split<I, S>(names: I) -> ParameterGroups
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut groups = ParameterGroups::new();
    groups.insert("transformers", Vec::new());
    groups.insert("other", Vec::new());
    for name in names {
        let name = name.into();
        let key = if is_transformer_block_param(&name) {
            "transformers"
        } else {
            "other"
        };
        groups.entry(key).or_default().push(name);
    }
    groups
}

/// Splits parameters of the second attention path from the rest, for tuning
/// only the added path of a dual-cross-attention backbone.
pub fn dual_attn_split<I, S>(names: I) -> ParameterGroups
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut groups = ParameterGroups::new();
    groups.insert("dual_attn", Vec::new());
    groups.insert("other", Vec::new());
    for name in names {
        let name = name.into();
        let key = if is_dual_attn_transformer_param(&name) {
            "dual_attn"
        } else {
            "other"
        };
        groups.entry(key).or_default().push(name);
    }
    groups
}

/// Five-way split for a multi-modal backbone with separate image and text
/// branches: each branch contributes a transformer group and a remainder
/// group, everything outside the two branches lands in `rest`.
pub fn multimodal_split<I, S>(names: I) -> ParameterGroups
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut groups = ParameterGroups::new();
    for key in ["image_trans", "image_rest", "text_trans", "text_rest", "rest"] {
        groups.insert(key, Vec::new());
    }
    for name in names {
        let name = name.into();
        let branch = if name.contains(".unet_image.") {
            Some("image")
        } else if name.contains(".unet_text.") {
            Some("text")
        } else {
            None
        };
        let key = match (branch, is_transformer_block_param(&name)) {
            (Some("image"), true) => "image_trans",
            (Some("image"), false) => "image_rest",
            (Some("text"), true) => "text_trans",
            (Some("text"), false) => "text_rest",
            _ => "rest",
        };
        groups.entry(key).or_default().push(name);
    }
    groups
}
