//! Post-processing shader descriptors and chain resolution.
//!
//! A chain is configured as a list of names. Each name expands to the shader
//! and its ancestors (through `parent`), ancestors first. Upscaling and
//! supersampling filters must run first, so the name list is reordered before
//! resolution.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Prepended to every post-shader fragment body.
pub const POST_HEADER: &str = include_str!("../shaders/post_header.glsl");
pub const DEFAULT_POST_VERTEX: &str = include_str!("../shaders/present.vert");

/// Sentinel chain entry meaning "no shader".
pub const OFF: &str = "Off";

pub const MAX_SHADER_SETTINGS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderSetting {
    pub name: String,
    pub value: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderInfo {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default = "default_vertex_source")]
    pub vertex_source: String,
    /// Fragment body; [`POST_HEADER`] is prepended at compile time.
    pub fragment_source: String,
    /// Render at the size of the output rectangle instead of render resolution
    #[serde(default)]
    pub output_resolution: bool,
    /// Wants a 1x input
    #[serde(default)]
    pub upscaling: bool,
    /// Wants its input rendered this many times larger (0 or 1 = off)
    #[serde(default)]
    pub ssaa_level: u32,
    #[serde(default)]
    pub settings: Vec<ShaderSetting>,
}

fn default_vertex_source() -> String {
    DEFAULT_POST_VERTEX.to_string()
}

impl ShaderInfo {
    pub fn new(name: &str, fragment_source: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            vertex_source: default_vertex_source(),
            fragment_source: fragment_source.to_string(),
            output_resolution: false,
            upscaling: false,
            ssaa_level: 0,
            settings: Vec::new(),
        }
    }

    /// Complete fragment source as handed to the backend.
    pub fn full_fragment_source(&self) -> String {
        format!("{}\n{}", POST_HEADER, self.fragment_source)
    }

    /// Setting values, overridden by `overrides` where present.
    pub fn setting_values(&self, overrides: Option<&[f32; 4]>) -> [f32; 4] {
        let mut values = [0.0; 4];
        for (i, v) in values.iter_mut().enumerate() {
            *v = match (overrides, self.settings.get(i)) {
                (Some(o), Some(_)) => o[i],
                (_, Some(s)) => s.value,
                (_, None) => 0.0,
            };
        }
        values
    }

    fn forces_first(&self) -> bool {
        self.upscaling || self.ssaa_level >= 2
    }
}

/// Per-pass uniform block; matches the std140 `Data` block in the header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Default)]
pub struct PostShaderUniforms {
    pub texel_delta: [f32; 2],
    pub pixel_delta: [f32; 2],
    pub time: [f32; 4],
    pub setting: [f32; 4],
    pub video: f32,
    pub pad: [f32; 3],
    pub gl_half_pixel: [f32; 4],
}

/// Known post-processing shaders.
#[derive(Debug, Clone, Default)]
pub struct ShaderRegistry {
    shaders: Vec<ShaderInfo>,
}

impl ShaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the bundled shaders.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();

        reg.register(ShaderInfo::new(
            "Natural",
            include_str!("../shaders/post/natural.frag"),
        ));

        let mut scanlines = ShaderInfo::new(
            "Scanlines",
            include_str!("../shaders/post/scanlines.frag"),
        );
        scanlines.output_resolution = true;
        scanlines.settings.push(ShaderSetting {
            name: "Amount".to_string(),
            value: 0.5,
            min: 0.0,
            max: 1.0,
            step: 0.05,
        });
        reg.register(scanlines);

        let mut vignette = ShaderInfo::new(
            "Vignette",
            include_str!("../shaders/post/vignette.frag"),
        );
        vignette.settings.push(ShaderSetting {
            name: "Radius".to_string(),
            value: 0.75,
            min: 0.1,
            max: 1.0,
            step: 0.05,
        });
        vignette.settings.push(ShaderSetting {
            name: "Softness".to_string(),
            value: 0.45,
            min: 0.0,
            max: 1.0,
            step: 0.05,
        });
        reg.register(vignette);

        let mut sharp = ShaderInfo::new(
            "SharpBilinear",
            include_str!("../shaders/post/sharp_bilinear.frag"),
        );
        sharp.upscaling = true;
        sharp.output_resolution = true;
        reg.register(sharp);

        let mut ssaa = ShaderInfo::new(
            "SSAAGauss",
            include_str!("../shaders/post/ssaa_gauss.frag"),
        );
        ssaa.ssaa_level = 2;
        reg.register(ssaa);

        reg
    }

    /// Add a shader, replacing one with the same name.
    pub fn register(&mut self, info: ShaderInfo) {
        match self.shaders.iter_mut().find(|s| s.name == info.name) {
            Some(existing) => *existing = info,
            None => self.shaders.push(info),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ShaderInfo> {
        self.shaders.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.shaders.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// `name` and its ancestors, ancestors first. Stops at a cycle.
    pub fn chain_for(&self, name: &str) -> Vec<&ShaderInfo> {
        let mut backwards: Vec<&ShaderInfo> = Vec::new();
        let mut current = self.get(name);
        while let Some(info) = current {
            if backwards.iter().any(|s| s.name == info.name) {
                break;
            }
            backwards.push(info);
            current = match info.parent.as_deref() {
                Some(parent) if parent != OFF => self.get(parent),
                _ => None,
            };
        }
        backwards.reverse();
        backwards
    }

    /// Expand a configured name list into the full pass list.
    pub fn resolve_chain(&self, names: &[String]) -> Vec<&ShaderInfo> {
        let mut chain = Vec::new();
        for name in names {
            if name == OFF {
                break;
            }
            chain.extend(self.chain_for(name));
        }
        chain
    }

    pub fn remove_unknown(&self, names: &mut Vec<String>) {
        names.retain(|n| n != OFF && self.get(n).is_some());
    }

    /// Move upscaling and supersampling filters to the front, keeping the
    /// relative order of everything else.
    pub fn fix_order(&self, names: &mut Vec<String>) {
        let (mut first, rest): (Vec<String>, Vec<String>) = names
            .drain(..)
            .partition(|n| self.get(n).map(ShaderInfo::forces_first).unwrap_or(false));
        first.extend(rest);
        *names = first;
    }

    /// Clean a configured list and resolve it.
    pub fn configured_chain(&self, configured: &[String]) -> Vec<ShaderInfo> {
        let mut names = configured.to_vec();
        self.remove_unknown(&mut names);
        self.fix_order(&mut names);
        self.resolve_chain(&names).into_iter().cloned().collect()
    }
}

const UNINTERESTING_LINES: [&str; 4] = [
    "Fragment shader failed to compile with the following errors:",
    "Vertex shader failed to compile with the following errors:",
    "Compile failed.",
    "",
];

/// User-facing message for a compiler log: the first informative line, or a
/// pointer to the log when there is none.
pub fn post_shader_error_message(error: &str) -> String {
    let first = error
        .split_inclusive('\n')
        .filter(|l| l.ends_with('\n'))
        .map(|l| l.trim_end_matches('\n').trim_end_matches('\r'))
        .find(|l| !UNINTERESTING_LINES.contains(l));
    match first {
        Some(line) => format!("Post-shader error: {}...:\n{}", line, error),
        None => "Post-shader error, see log for details".to_string(),
    }
}
