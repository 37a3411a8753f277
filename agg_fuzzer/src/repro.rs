//! Persisting and reloading reproduction cases.
//!
//! A case lives in `<base>/aggregation_fuzzer_<iteration>_<seed>/`. Split
//! files are copied next to one `plan_nodes_<k>.json` file per plan
//! variant, so the directory is self-contained and can be moved around.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FuzzerError, Result};
use crate::splits::Split;
use crate::variants::PlanVariant;

pub const PLAN_NODE_FILE_NAME: &str = "plan_nodes";

/// One persisted plan variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproCase {
    pub seed: u64,
    pub iteration: usize,
    pub custom_verification: bool,
    pub variant: PlanVariant,
}

fn plan_file(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{PLAN_NODE_FILE_NAME}_{index}.json"))
}

/// Writes `variants` under `base_path` and returns the case directory.
pub fn persist_repro_info(
    variants: &[PlanVariant],
    base_path: &Path,
    seed: u64,
    iteration: usize,
    custom_verification: bool,
) -> Result<PathBuf> {
    let dir = base_path.join(format!("aggregation_fuzzer_{iteration}_{seed}"));
    fs::create_dir_all(&dir)?;

    let mut copied: HashMap<PathBuf, PathBuf> = HashMap::new();
    for (index, variant) in variants.iter().enumerate() {
        let mut variant = variant.clone();
        for split in &mut variant.shape.splits {
            let relative = match copied.get(&split.path) {
                Some(relative) => relative.clone(),
                None => {
                    let relative = PathBuf::from(format!("split_{}.json", copied.len()));
                    fs::copy(&split.path, dir.join(&relative))?;
                    copied.insert(split.path.clone(), relative.clone());
                    relative
                }
            };
            *split = Split::new(relative);
        }
        let case = ReproCase {
            seed,
            iteration,
            custom_verification,
            variant,
        };
        fs::write(plan_file(&dir, index), serde_json::to_vec_pretty(&case)?)?;
    }
    tracing::info!(
        "persisted {} plans and {} splits to {}",
        variants.len(),
        copied.len(),
        dir.display()
    );
    Ok(dir)
}

/// Reads back every plan of a persisted case, in variant order, with split
/// paths resolved against `dir`.
pub fn load_repro_info(dir: &Path) -> Result<Vec<ReproCase>> {
    let mut cases = Vec::new();
    loop {
        let path = plan_file(dir, cases.len());
        if !path.exists() {
            break;
        }
        let mut case: ReproCase = serde_json::from_slice(&fs::read(&path)?)?;
        for split in &mut case.variant.shape.splits {
            split.path = dir.join(&split.path);
        }
        cases.push(case);
    }
    if cases.is_empty() {
        return Err(FuzzerError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no {PLAN_NODE_FILE_NAME} files in {}", dir.display()),
        )));
    }
    Ok(cases)
}
