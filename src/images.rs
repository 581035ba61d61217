//! The image vector: which container image to run for a component, optionally depending on the
//! Kubernetes versions of the seed (runtime) and the shoot (target).

use std::path::Path;

use serde::Deserialize;

use crate::utils::version::KubernetesVersion;
use crate::{Error, Result};

pub const IMAGE_NAME_KUBE_STATE_METRICS: &str = "kube-state-metrics";
pub const IMAGE_NAME_ISTIO_ISTIOD: &str = "istio-istiod";
pub const IMAGE_NAME_ISTIO_PROXY: &str = "istio-proxy";
pub const IMAGE_NAME_GRAFANA: &str = "grafana";
pub const IMAGE_NAME_VALI: &str = "vali";

const BUILTIN: &str = include_str!("../assets/images.yaml");

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub name: String,
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
    /// Constraint on the seed's Kubernetes version, e.g. `>= 1.26`
    #[serde(default)]
    pub runtime_version: Option<String>,
    /// Constraint on the shoot's Kubernetes version
    #[serde(default)]
    pub target_version: Option<String>,
}

impl ImageSource {
    /// `repository:tag`, or the plain repository when it has no tag
    pub fn image(&self) -> String {
        match &self.tag {
            Some(tag) if tag.starts_with("sha256:") => format!("{}@{tag}", self.repository),
            Some(tag) => format!("{}:{tag}", self.repository),
            None => self.repository.clone(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ImageVector {
    pub images: Vec<ImageSource>,
}

/// Checks `version` against a comma separated list of `<op> <version>` terms
fn matches_constraint(constraint: &str, version: KubernetesVersion) -> Result<bool> {
    for term in constraint.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let split = term
            .find(|c: char| c.is_ascii_digit() || c == 'v')
            .ok_or_else(|| Error::InvalidKubernetesVersion(term.into()))?;
        let (op, bound) = term.split_at(split);
        let bound: KubernetesVersion = bound.parse()?;
        let ok = match op.trim() {
            ">=" => version >= bound,
            ">" => version > bound,
            "<=" => version <= bound,
            "<" => version < bound,
            "=" | "==" | "" => version == bound,
            "!=" => version != bound,
            _ => return Err(Error::InvalidKubernetesVersion(term.into())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

impl ImageVector {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }

    /// The images shipped with this binary
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN)
    }

    /// Entries of `overwrite` take precedence over the ones of `self` with the same name
    pub fn overwritten_by(self, overwrite: ImageVector) -> Self {
        let mut images = overwrite.images;
        images.extend(self.images);
        Self { images }
    }

    /// The first entry named `name` whose version constraints hold. Constraints are only
    /// checked when the corresponding version is given.
    pub fn find_image(
        &self,
        name: &str,
        runtime_version: Option<KubernetesVersion>,
        target_version: Option<KubernetesVersion>,
    ) -> Result<&ImageSource> {
        for source in self.images.iter().filter(|s| s.name == name) {
            let fits = |constraint: &Option<String>, version: Option<KubernetesVersion>| {
                match (constraint, version) {
                    (Some(c), Some(v)) => matches_constraint(c, v),
                    _ => Ok(true),
                }
            };
            if fits(&source.runtime_version, runtime_version)?
                && fits(&source.target_version, target_version)?
            {
                return Ok(source);
            }
        }
        Err(Error::ImageNotFound(name.into()))
    }
}
