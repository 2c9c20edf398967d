/// Configuration module.
///
/// Gets custom config values from environment variables and the
/// Rocket.toml config file.  Values set as environment variables will
/// override like values in the config file.
use crate::error::{Error, Result};
use crate::tiler::TileLayout;
use rocket::fairing;
use rocket::fs::FileServer;
use rocket::{Build, Rocket};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Usage tracker names.
pub const NONE_TRACKER: &str = "none";
pub const CONSOLE_TRACKER: &str = "console";
pub const DB_TRACKER: &str = "db";

/// Name of the dataset-list folder inside the cache root.
pub const DATASET_LIST_FOLDER: &str = "datasetList";

/// Look a setting up: environment first, then Rocket.toml, then the default.
fn lookup(rocket: &Rocket<Build>, env_name: &str, cfg_name: &str, default: &str) -> String {
    match env::var(env_name) {
        Ok(val) => val,
        Err(_) => rocket
            .figment()
            .extract_inner::<String>(cfg_name)
            .unwrap_or_else(|_| default.to_string()),
    }
}

fn lookup_parsed<T: std::str::FromStr>(
    rocket: &Rocket<Build>,
    env_name: &str,
    cfg_name: &str,
    default: T,
) -> T {
    if let Ok(val) = env::var(env_name) {
        return match val.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring unparsable {}={}", env_name, val);
                default
            }
        };
    }
    rocket
        .figment()
        .extract_inner::<i64>(cfg_name)
        .ok()
        .and_then(|v| v.to_string().parse::<T>().ok())
        .unwrap_or(default)
}

/// Where the disk cache lives.
pub struct CacheRoot(pub PathBuf);

const CACHE_ROOT_ENV_NAME: &str = "CACHE_ROOT";
const CACHE_ROOT_ROCKET_CFG: &str = "cache_root";
const CACHE_ROOT_DEFAULT: &str = "static/cache";

impl CacheRoot {
    /// Absolute path of the cache root, creating the folder if needed.
    pub fn abs_path(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.0)?;
        Ok(fs::canonicalize(&self.0)?)
    }
}

pub fn get_cache_root(rocket: Rocket<Build>) -> fairing::Result {
    let root = lookup(
        &rocket,
        CACHE_ROOT_ENV_NAME,
        CACHE_ROOT_ROCKET_CFG,
        CACHE_ROOT_DEFAULT,
    );
    info!("Cache root: {}", root);
    Ok(rocket.manage(CacheRoot(PathBuf::from(root))))
}

/// Where the pages and static assets live.
pub struct StaticRoot(pub PathBuf);

/// Installs the static root and serves it under `/static`.
pub fn get_static_root(rocket: Rocket<Build>) -> fairing::Result {
    let root = PathBuf::from(lookup(&rocket, "STATIC_ROOT", "static_root", "static"));
    let rocket = if root.is_dir() {
        rocket.mount("/static", FileServer::from(&root))
    } else {
        warn!("Static root {} is missing, not serving /static", root.display());
        rocket
    };
    Ok(rocket.manage(StaticRoot(root)))
}

/// Drive access settings.
pub struct DriveSettings {
    /// Google client secrets JSON used for the OAuth flow.
    pub client_secrets_filename: String,
    /// Folder under which all experiment folders live; used to build paths.
    pub top_folder_id: String,
    /// Externally visible base URL, needed for the OAuth redirect.
    pub public_url: String,
    pub demo: DemoSettings,
}

/// A dataset that anyone may look at, using stored credentials.
pub struct DemoSettings {
    pub credentials_filename: String,
    pub name: String,
    pub id: String,
}

impl DemoSettings {
    /// Requests for the demo folder or dataset don't need a login.
    pub fn allows(&self, folder_or_dataset: &str) -> bool {
        !folder_or_dataset.is_empty()
            && (folder_or_dataset == self.id || folder_or_dataset == self.name)
    }
}

pub fn get_drive_settings(rocket: Rocket<Build>) -> fairing::Result {
    let settings = DriveSettings {
        client_secrets_filename: lookup(
            &rocket,
            "CLIENT_SECRETS_FILENAME",
            "client_secrets_filename",
            "config/credentials.json",
        ),
        top_folder_id: lookup(&rocket, "TOP_DRIVE_FOLDER_ID", "top_drive_folder_id", ""),
        public_url: lookup(&rocket, "PUBLIC_URL", "public_url", "http://localhost:8000"),
        demo: DemoSettings {
            credentials_filename: lookup(
                &rocket,
                "DEMO_CREDENTIALS_FILENAME",
                "demo_credentials_filename",
                "config/demo_credentials.json",
            ),
            name: lookup(&rocket, "DEMO_NAME", "demo_name", ""),
            id: lookup(&rocket, "DEMO_ID", "demo_id", ""),
        },
    };
    info!("Public url: {}", settings.public_url);
    Ok(rocket.manage(settings))
}

/// How tracked-cell tables and image stacks are laid out in the MATLAB files.
pub struct ConversionSettings {
    pub layout: TileLayout,
    pub jpeg_quality: u8,
    /// `none`, `fill` or `outline`.
    pub label_overlay: String,
    pub overlay_alpha: f64,
    pub track_filename: String,
    pub track_variable: String,
    pub track_columns: Vec<String>,
    pub image_stack_filename: String,
    pub image_variable: String,
    pub label_variable: String,
    /// Whether x/y in the track table count pixels from 1, MATLAB style.
    pub one_based_coordinates: bool,
}

pub const DEFAULT_TRACK_COLUMNS: &str = "id,time,x,y,Mass (pg),Location ID,Frame ID";

impl Default for ConversionSettings {
    fn default() -> Self {
        ConversionSettings {
            layout: TileLayout {
                tile_width: 0,
                tile_height: 0,
                number_of_columns: 10,
                tiles_per_file: 100,
            },
            jpeg_quality: 90,
            label_overlay: "none".to_string(),
            overlay_alpha: 0.35,
            track_filename: "data_allframes.mat".to_string(),
            track_variable: "data_allframes".to_string(),
            track_columns: split_columns(DEFAULT_TRACK_COLUMNS),
            image_stack_filename: "imageStack.mat".to_string(),
            image_variable: "images".to_string(),
            label_variable: "labels".to_string(),
            one_based_coordinates: true,
        }
    }
}

pub fn split_columns(list: &str) -> Vec<String> {
    list.split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

pub fn get_conversion_settings(rocket: Rocket<Build>) -> fairing::Result {
    let defaults = ConversionSettings::default();
    let number_of_columns = lookup_parsed(
        &rocket,
        "TILE_COLUMNS",
        "tile_columns",
        defaults.layout.number_of_columns,
    );
    let tiles_per_file = lookup_parsed(
        &rocket,
        "TILES_PER_FILE",
        "tiles_per_file",
        defaults.layout.tiles_per_file,
    );
    if let Err(e) = TileLayout::new(1, 1, number_of_columns, tiles_per_file) {
        error!("Invalid tile layout: {}", e);
        return Err(rocket);
    }
    let settings = ConversionSettings {
        layout: TileLayout {
            tile_width: 0,
            tile_height: 0,
            number_of_columns,
            tiles_per_file,
        },
        jpeg_quality: lookup_parsed(
            &rocket,
            "JPEG_QUALITY",
            "jpeg_quality",
            defaults.jpeg_quality,
        ),
        label_overlay: lookup(&rocket, "LABEL_OVERLAY", "label_overlay", "none"),
        overlay_alpha: defaults.overlay_alpha,
        track_filename: lookup(
            &rocket,
            "TRACK_FILENAME",
            "track_filename",
            &defaults.track_filename,
        ),
        track_variable: lookup(
            &rocket,
            "TRACK_VARIABLE",
            "track_variable",
            &defaults.track_variable,
        ),
        track_columns: split_columns(&lookup(
            &rocket,
            "TRACK_COLUMNS",
            "track_columns",
            DEFAULT_TRACK_COLUMNS,
        )),
        image_stack_filename: lookup(
            &rocket,
            "IMAGE_STACK_FILENAME",
            "image_stack_filename",
            &defaults.image_stack_filename,
        ),
        image_variable: lookup(
            &rocket,
            "IMAGE_VARIABLE",
            "image_variable",
            &defaults.image_variable,
        ),
        label_variable: lookup(
            &rocket,
            "LABEL_VARIABLE",
            "label_variable",
            &defaults.label_variable,
        ),
        one_based_coordinates: lookup(&rocket, "ONE_BASED_COORDINATES", "one_based_coordinates", "true")
            .parse::<bool>()
            .unwrap_or(true),
    };
    Ok(rocket.manage(settings))
}

/// Cache usage tracker settings.
pub struct UsageTracker {
    pub kind: String,
    pub db_url: String,
    pub max_entries: u32,
}

const USAGE_TRACKER_ENV_NAME: &str = "USAGE_TRACKER";
const USAGE_TRACKER_ROCKET_CFG: &str = "usage_tracker";

/// Gets the usage tracker to use.  First checks for an environment
/// variable.  Then checks for a value in the Rocket.toml file.
pub fn get_usage_tracker(rocket: Rocket<Build>) -> fairing::Result {
    let tracker = UsageTracker {
        kind: lookup(
            &rocket,
            USAGE_TRACKER_ENV_NAME,
            USAGE_TRACKER_ROCKET_CFG,
            NONE_TRACKER,
        ),
        db_url: lookup(&rocket, "CACHE_DB_URL", "cache_db_url", "cache.sqlite"),
        max_entries: lookup_parsed(&rocket, "MAX_CACHE_ENTRIES", "max_cache_entries", 1000),
    };
    Ok(rocket.manage(tracker))
}

/// Read a whole config file, with a readable error naming the file.
pub fn read_config_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("couldn't read {}: {}", path, e)))
}
