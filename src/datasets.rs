/// Dataset list module.
///
/// Every experiment folder that has been prepared for viewing contains a
/// `.vizMetaData` folder. Rebuilding the dataset list finds all of them,
/// turns each into a small JSON description stored under
/// `<cache_root>/datasetList/`, and merges those into the single
/// `derived/combined.json` the overview page loads.
use crate::cache::DiskCache;
use crate::config::DATASET_LIST_FOLDER;
use crate::drive::{self, DriveFile, DriveService};
use crate::error::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::fs;

pub const VIZ_METADATA_FOLDER: &str = ".vizMetaData";
pub const EXPERIMENT_METADATA: &str = "experimentMetaData.json";
pub const MASS_OVER_TIME_PB: &str = "massOverTime.pb";
pub const DERIVED_FOLDER: &str = "derived";
pub const COMBINED_FILENAME: &str = "combined.json";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Where `combined.json` lives, as a cache folder id.
pub fn derived_folder() -> String {
    format!("{}/{}", DATASET_LIST_FOLDER, DERIVED_FOLDER)
}

pub enum SpecOutcome {
    Ready(Map<String, Value>),
    Rejected(String),
}

fn is_blank(spec: &Map<String, Value>, key: &str) -> bool {
    match spec.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn fill(spec: &mut Map<String, Value>, key: &str, value: String) {
    if is_blank(spec, key) {
        spec.insert(key.to_string(), Value::String(value));
    }
}

/// Build the description of one experiment from its `.vizMetaData` folder.
pub async fn build_spec_obj(
    drive: &dyn DriveService,
    top_folder_id: &str,
    viz_folder: &DriveFile,
) -> Result<SpecOutcome> {
    let metadata = match drive::find_file(drive, &viz_folder.id, EXPERIMENT_METADATA).await? {
        Some(file) => file,
        None => {
            return Ok(SpecOutcome::Rejected(format!(
                "Missing {} in {}",
                EXPERIMENT_METADATA, viz_folder.id
            )))
        }
    };
    let mass_over_time = match drive::find_file(drive, &viz_folder.id, MASS_OVER_TIME_PB).await? {
        Some(file) => file,
        None => {
            return Ok(SpecOutcome::Rejected(format!(
                "Missing {} in {}",
                MASS_OVER_TIME_PB, viz_folder.id
            )))
        }
    };
    let size = match mass_over_time.size {
        Some(size) => size,
        None => drive.get_file(&mass_over_time.id).await?.size.unwrap_or(0),
    };

    let mut spec = match serde_json::from_slice::<Value>(&drive.download(&metadata.id).await?) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Ok(SpecOutcome::Rejected(format!(
                "{} in {} is not a JSON object",
                EXPERIMENT_METADATA, viz_folder.id
            )))
        }
        Err(e) => {
            return Ok(SpecOutcome::Rejected(format!(
                "Unreadable {} in {}: {}",
                EXPERIMENT_METADATA, viz_folder.id, e
            )))
        }
    };

    let parent_id = match viz_folder.parents.first() {
        Some(p) => p.clone(),
        None => return Ok(SpecOutcome::Rejected(format!("{} has no parent", viz_folder.id))),
    };
    let path = drive::folder_path(drive, top_folder_id, &parent_id).await?;
    if path.is_empty() {
        warn!("Cannot find {} in {}", parent_id, top_folder_id);
    }

    spec.insert("googleDriveId".to_string(), Value::String(parent_id.clone()));
    fill(
        &mut spec,
        "folder",
        if path.is_empty() {
            "unknown".to_string()
        } else {
            format!("{}/", path.join("/"))
        },
    );
    fill(
        &mut spec,
        "author",
        viz_folder
            .owners
            .first()
            .map(|o| o.display_name.clone())
            .unwrap_or_else(|| "unknown".to_string()),
    );
    fill(&mut spec, "displayName", display_name(&path));
    fill(&mut spec, "uniqueId", parent_id);
    if let Some(modified) = viz_folder.modified_time {
        spec.insert(
            "modifiedDate".to_string(),
            Value::String(modified.format("%Y-%m-%d").to_string()),
        );
    }
    spec.insert("fileSize".to_string(), json!(size));
    Ok(SpecOutcome::Ready(spec))
}

/// `<third folder>/.../<experiment folder>`, skipping the `Data/<lab>`
/// prefix every path shares.
fn display_name(path: &[String]) -> String {
    match (path.get(2), path.last()) {
        (Some(first), Some(last)) => format!("{}/.../{}", first, last),
        (None, Some(last)) => last.clone(),
        _ => "unknown".to_string(),
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct UpdateReport {
    pub lines: Vec<String>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl UpdateReport {
    pub fn summary(&self) -> String {
        format!(
            "Total: {}; Passed: {}; Failed: {}; ",
            self.total, self.passed, self.failed
        )
    }

    fn fail(&mut self, reason: &str, folder_id: &str) {
        self.lines.push(format!("FAIL ({}) - {}", reason, folder_id));
        self.failed += 1;
    }
}

/// Rebuild every dataset description from the drive, then the combined list.
pub async fn update_dataset_list(
    drive: &dyn DriveService,
    top_folder_id: &str,
    cache: &DiskCache,
) -> Result<UpdateReport> {
    let candidates = drive.list_files(&drive::name_query(VIZ_METADATA_FOLDER)).await?;
    info!("Number of {} folders: {}", VIZ_METADATA_FOLDER, candidates.len());

    let mut report = UpdateReport {
        total: candidates.len(),
        ..UpdateReport::default()
    };
    let mut seen = HashSet::new();
    for (index, candidate) in candidates.iter().enumerate() {
        info!("Building: {}/{}", index + 1, candidates.len());
        let spec = match build_spec_obj(drive, top_folder_id, candidate).await {
            Ok(SpecOutcome::Ready(spec)) => spec,
            Ok(SpecOutcome::Rejected(reason)) => {
                report.fail(&reason, &candidate.id);
                continue;
            }
            Err(e) => {
                report.fail(&e.to_string(), &candidate.id);
                continue;
            }
        };
        let unique_id = match spec.get("uniqueId") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        if !seen.insert(unique_id.clone()) {
            // Reported, but only counted in the total.
            report
                .lines
                .push(format!("FAIL (duplicate filename[{}]) - {}", unique_id, candidate.id));
            continue;
        }
        let filename = format!("{}.json", unique_id);
        if let Err(e) = cache.write_untracked(
            DATASET_LIST_FOLDER,
            &filename,
            &serde_json::to_vec(&Value::Object(spec))?,
        ) {
            report.fail(&e.to_string(), &candidate.id);
            continue;
        }
        report.lines.push(format!("PASS - {}", candidate.id));
        report.passed += 1;
    }
    combine_dataset_files(cache)?;
    Ok(report)
}

/// Megabytes from a `fileSize` that may be a number or a numeric string.
fn size_in_mb(value: Option<&Value>) -> f64 {
    let bytes = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    bytes / BYTES_PER_MB
}

fn text(spec: &Map<String, Value>, key: &str) -> String {
    match spec.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Merge dataset descriptions into the overview document.
pub fn combine_dataset_specs(specs: Vec<Map<String, Value>>) -> Value {
    let mut authors = BTreeSet::new();
    let mut max_size = 0.0_f64;
    let mut combined = Vec::with_capacity(specs.len());
    for mut spec in specs {
        let id = text(&spec, "uniqueId");
        let drive_url = format!(
            "https://drive.google.com/drive/u/1/folders/{}",
            text(&spec, "googleDriveId")
        );
        spec.insert(
            "vizLinkHtml".to_string(),
            Value::String(format!(
                "<a href=\"/detailedView/{}\" target=\"_blank\">Viz Link</a>",
                id
            )),
        );
        spec.insert(
            "driveLinkHtml".to_string(),
            Value::String(format!(
                "<a href=\"{}\" target=\"_blank\">Drive Link</a>",
                drive_url
            )),
        );
        authors.insert(text(&spec, "author"));
        let size = size_in_mb(spec.get("fileSize"));
        max_size = max_size.max(size);
        spec.insert("fileSize".to_string(), json!(size));
        spec.remove("locationMaps");
        combined.push(Value::Object(spec));
    }
    json!({
        "authorList": authors.into_iter().collect::<Vec<_>>(),
        "sizeRange": [0.0, max_size],
        "datasetList": combined,
    })
}

/// Read every `*.json` in the dataset-list folder and write the combined
/// document. Files that don't parse are skipped. Dataset-list files are
/// kept out of the usage tracker: only a rebuild replaces them.
pub fn combine_dataset_files(cache: &DiskCache) -> Result<Value> {
    let dir = cache.root().join(DATASET_LIST_FOLDER);
    fs::create_dir_all(&dir)?;
    let mut names: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".json"))
        .collect();
    names.sort();

    let mut specs = Vec::with_capacity(names.len());
    for name in names {
        match serde_json::from_slice::<Value>(&cache.read_untracked(DATASET_LIST_FOLDER, &name)?) {
            Ok(Value::Object(spec)) => specs.push(spec),
            _ => warn!("Skipping unreadable dataset spec {}", name),
        }
    }
    let combined = combine_dataset_specs(specs);
    let pretty = serde_json::to_vec_pretty(&combined)?;
    cache.write_untracked(&derived_folder(), COMBINED_FILENAME, &pretty)?;
    Ok(combined)
}

/// The stored description of one dataset.
pub fn dataset_spec(cache: &DiskCache, dataset_id: &str) -> Result<Option<Vec<u8>>> {
    let name = format!("{}.json", dataset_id);
    if !cache.is_cached(DATASET_LIST_FOLDER, &name)? {
        return Ok(None);
    }
    cache.read_untracked(DATASET_LIST_FOLDER, &name).map(Some)
}

/// The combined list, if it has been built.
pub fn dataset_list(cache: &DiskCache) -> Result<Option<Vec<u8>>> {
    match cache.read_untracked(&derived_folder(), COMBINED_FILENAME) {
        Ok(data) => Ok(Some(data)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
