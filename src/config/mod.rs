use std::{fs, path::Path};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::surt::Layer;

/// Tunables for one layer of the key hierarchy.
///
/// The rollup threshold at depth `i` follows a power law fitted to the
/// branching factor observed in real archives:
///
///   cutoff(i) = alpha * (i + 1)^(-k) * compaction_factor
///
/// A node is collapsed once it has strictly more distinct children than its
/// cutoff, so a larger `compaction_factor` keeps more detail and an infinite
/// one disables rollups for the layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayerConfig {
    pub alpha: f64,
    pub k: f64,
    pub compaction_factor: f64,
    pub max_depth: usize,
}

impl LayerConfig {
    pub fn host() -> Self {
        LayerConfig {
            alpha: 16.329,
            k: 0.714,
            compaction_factor: 1.0,
            max_depth: 8,
        }
    }

    pub fn path() -> Self {
        LayerConfig {
            alpha: 24.546,
            k: 1.429,
            compaction_factor: 1.0,
            max_depth: 9,
        }
    }

    pub fn cutoffs(&self) -> Vec<f64> {
        (0..self.max_depth)
            .map(|i| self.alpha * ((i + 1) as f64).powf(-self.k) * self.compaction_factor)
            .collect()
    }
}

/// Partial layer settings, as found in a config file or on the command line.
/// Unset fields leave the current value alone.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerOverrides {
    pub alpha: Option<f64>,
    pub k: Option<f64>,
    pub compaction_factor: Option<f64>,
    pub max_depth: Option<usize>,
}

impl LayerOverrides {
    pub fn apply(&self, layer: &mut LayerConfig) {
        if let Some(alpha) = self.alpha {
            layer.alpha = alpha;
        }
        if let Some(k) = self.k {
            layer.k = k;
        }
        if let Some(cf) = self.compaction_factor {
            layer.compaction_factor = cf;
        }
        if let Some(depth) = self.max_depth {
            layer.max_depth = depth;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    host: LayerOverrides,
    path: LayerOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Config {
    pub host: LayerConfig,
    pub path: LayerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: LayerConfig::host(),
            path: LayerConfig::path(),
        }
    }
}

impl Config {
    /// Settings for building a map straight from captures: no rollups unless
    /// the caller lowers the compaction factors.
    pub fn uncompacted() -> Self {
        let mut config = Config::default();
        config.host.compaction_factor = f64::INFINITY;
        config.path.compaction_factor = f64::INFINITY;
        config
    }

    /// Reads a JSON config file on top of `self`. Layers and fields missing
    /// from the file keep their current values.
    pub fn load<P>(mut self, path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config {}", path.as_ref().display()))?;
        let file: ConfigFile = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.as_ref().display()))?;
        file.host.apply(&mut self.host);
        file.path.apply(&mut self.path);
        self.validate()?;
        Ok(self)
    }

    pub fn layer(&self, layer: Layer) -> &LayerConfig {
        match layer {
            Layer::Host => &self.host,
            Layer::Path => &self.path,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for layer in Layer::ALL {
            let c = self.layer(layer);
            if c.max_depth == 0 {
                bail!("{} max depth must be at least 1", layer);
            }
            if c.alpha.is_nan() || c.k.is_nan() || c.compaction_factor.is_nan() {
                bail!("{} cutoff parameters must be numbers", layer);
            }
        }
        Ok(())
    }
}

/// Per-depth rollup thresholds, computed once per compaction run.
#[derive(Debug, Clone)]
pub struct Cutoffs {
    host: Vec<f64>,
    path: Vec<f64>,
}

impl Cutoffs {
    pub fn new(config: &Config) -> Self {
        Cutoffs {
            host: config.host.cutoffs(),
            path: config.path.cutoffs(),
        }
    }

    pub fn get(&self, layer: Layer, depth: usize) -> f64 {
        match layer {
            Layer::Host => self.host[depth],
            Layer::Path => self.path[depth],
        }
    }

    pub fn exceeds(&self, layer: Layer, depth: usize, ccount: u64) -> bool {
        ccount as f64 > self.get(layer, depth)
    }
}
