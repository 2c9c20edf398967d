/// Artifact module.
///
/// Produces everything the detailed view loads for one experiment folder:
/// the track table (protobuf and CSV), the tile layout, and the per-location
/// image and label bundles. Each artifact is looked for in the cache, then as
/// a pre-built file on the drive, and only then converted from the MATLAB
/// sources. Conversions cache everything they produce.
use crate::cache::{ArtifactSource, CacheLayer, DiskCache, DriveRelay};
use crate::config::ConversionSettings;
use crate::datasets::{MASS_OVER_TIME_PB, VIZ_METADATA_FOLDER};
use crate::drive::DriveService;
use crate::error::{Error, Result};
use crate::labels::{self, CoordinateMapping};
use crate::matrix;
use crate::table::TrackTable;
use crate::tiler::{self, LabelOverlay, TileLayout};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

pub const MASS_OVER_TIME_CSV: &str = "massOverTime.csv";
pub const IMAGE_METADATA: &str = "imageMetaData.json";

pub const X_COLUMN: &str = "x";
pub const Y_COLUMN: &str = "y";
pub const FRAME_COLUMN: &str = "Frame ID";
pub const LOCATION_COLUMN: &str = "Location ID";

/// Location used to derive the tile layout when nothing else provides one.
const FIRST_LOCATION: u32 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// Cache folder of one location: `<folder>/data<loc>`, same as on the drive.
pub fn location_folder(folder_id: &str, location: u32) -> String {
    format!("{}/data{}", folder_id, location)
}

pub fn image_bundle_name(bundle: u32, format: ImageFormat) -> String {
    format!("D{}.{}", bundle, format.extension())
}

pub fn label_bundle_name(bundle: u32) -> String {
    format!("L{}.pb", bundle)
}

/// Left in a location folder by a finished build. Written outside the usage
/// tracker, so it survives the eviction of single bundles and tells a
/// missing bundle (rebuild) from one past the end (404).
pub const LOCATION_MARKER: &str = "location.json";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationMarker {
    pub frames: u32,
    pub bundles: u32,
    pub labels: bool,
}

/// What converting one location's image stack produced.
pub struct BuiltLocation {
    pub layout: TileLayout,
    pub frames: u32,
    pub labels: Option<Array3<u32>>,
}

pub struct Pipeline<'a> {
    drive: &'a dyn DriveService,
    cache: &'a DiskCache,
    settings: &'a ConversionSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        drive: &'a dyn DriveService,
        cache: &'a DiskCache,
        settings: &'a ConversionSettings,
    ) -> Pipeline<'a> {
        Pipeline {
            drive,
            cache,
            settings,
        }
    }

    /// `massOverTime.pb`: the drive copy in `.vizMetaData`, cached while it
    /// stays newer than the remote file. Without one, the track matrix is
    /// converted instead.
    pub async fn mass_over_time_pb(&self, folder_id: &str) -> Result<Vec<u8>> {
        let layer = CacheLayer::revalidating(
            self.cache,
            Box::new(DriveRelay::within(self.drive, VIZ_METADATA_FOLDER)),
        );
        if let Some(data) = layer.fetch(folder_id, MASS_OVER_TIME_PB).await? {
            return Ok(data);
        }
        info!("No {} for {}, converting the track matrix", MASS_OVER_TIME_PB, folder_id);
        let data = self.track_table(folder_id).await?.to_protobuf();
        self.cache.write(folder_id, MASS_OVER_TIME_PB, &data)?;
        Ok(data)
    }

    /// `massOverTime.csv`: the track matrix as CSV, with the segment label
    /// of every measurement when label stacks exist. Rebuilt whenever the
    /// track matrix on the drive is newer than the cached CSV.
    pub async fn mass_over_time_csv(&self, folder_id: &str) -> Result<Vec<u8>> {
        let relay = DriveRelay::new(self.drive);
        if self.cache.is_cached(folder_id, MASS_OVER_TIME_CSV)? {
            let fresh = match relay.modified(folder_id, &self.settings.track_filename).await? {
                Some(remote) => self.cache.is_fresh(folder_id, MASS_OVER_TIME_CSV, remote)?,
                None => true,
            };
            if fresh {
                return self.cache.read(folder_id, MASS_OVER_TIME_CSV);
            }
        }

        let table = self.track_table(folder_id).await?;
        let table = match self.segment_labels(folder_id, &table).await? {
            Some(labels) => table.with_segment_labels(&labels)?,
            None => table,
        };
        let data = table.to_csv()?;
        self.cache.write(folder_id, MASS_OVER_TIME_CSV, &data)?;
        Ok(data)
    }

    /// The tile layout of the folder's image bundles.
    pub async fn image_metadata(&self, folder_id: &str) -> Result<Vec<u8>> {
        let layer = CacheLayer::new(
            self.cache,
            Box::new(DriveRelay::within(self.drive, VIZ_METADATA_FOLDER)),
        );
        if let Some(data) = layer.fetch(folder_id, IMAGE_METADATA).await? {
            return Ok(data);
        }
        self.build_location(folder_id, FIRST_LOCATION).await?;
        self.cache.read(folder_id, IMAGE_METADATA)
    }

    pub async fn image_bundle(
        &self,
        folder_id: &str,
        location: u32,
        bundle: u32,
        format: ImageFormat,
    ) -> Result<Vec<u8>> {
        self.location_artifact(folder_id, location, bundle, &image_bundle_name(bundle, format), false)
            .await
    }

    pub async fn label_bundle(&self, folder_id: &str, location: u32, bundle: u32) -> Result<Vec<u8>> {
        self.location_artifact(folder_id, location, bundle, &label_bundle_name(bundle), true)
            .await
    }

    /// Cache, then pre-built file on the drive, then build the location.
    /// Once a location has been built, only bundles inside its range are
    /// rebuilt; they went missing through eviction.
    async fn location_artifact(
        &self,
        folder_id: &str,
        location: u32,
        bundle: u32,
        name: &str,
        is_label: bool,
    ) -> Result<Vec<u8>> {
        let folder = location_folder(folder_id, location);
        let layer = CacheLayer::new(self.cache, Box::new(DriveRelay::new(self.drive)));
        if let Some(data) = layer.fetch(&folder, name).await? {
            return Ok(data);
        }
        if let Some(marker) = self.location_marker(&folder)? {
            if bundle >= marker.bundles || (is_label && !marker.labels) {
                return Err(Error::NotFound(format!("{} in {}", name, folder)));
            }
            info!("{} is gone from {}, rebuilding", name, folder);
        }
        self.build_location(folder_id, location).await?;
        self.cache.read(&folder, name)
    }

    fn location_marker(&self, folder: &str) -> Result<Option<LocationMarker>> {
        match self.cache.read_untracked(folder, LOCATION_MARKER) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(marker) => Ok(Some(marker)),
                Err(e) => {
                    warn!("Ignoring unreadable {} in {}: {}", LOCATION_MARKER, folder, e);
                    Ok(None)
                }
            },
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write `name` unless it is already cached, so a pre-built copy from
    /// the drive is kept.
    fn store_new(&self, folder: &str, name: &str, encode: impl FnOnce() -> Result<Vec<u8>>) -> Result<()> {
        if self.cache.is_cached(folder, name)? {
            debug!("Keeping cached {}/{}", folder, name);
            return Ok(());
        }
        self.cache.write(folder, name, &encode()?)?;
        Ok(())
    }

    async fn track_table(&self, folder_id: &str) -> Result<TrackTable> {
        let settings = self.settings;
        let data = DriveRelay::new(self.drive)
            .fetch(folder_id, &settings.track_filename)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("{} in {}", settings.track_filename, folder_id))
            })?;
        let rows = matrix::as_table(matrix::load_variable(&data, &settings.track_variable)?)?;
        Ok(TrackTable::new(rows, &settings.track_columns))
    }

    /// Segment label of every row, per location. `None` when the table
    /// can't be placed on label stacks or no location has one.
    async fn segment_labels(&self, folder_id: &str, table: &TrackTable) -> Result<Option<Vec<u32>>> {
        let measurements = match table.measurements(X_COLUMN, Y_COLUMN, FRAME_COLUMN) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };
        let locations = match table.distinct(LOCATION_COLUMN) {
            Ok(l) => l,
            Err(_) => return Ok(None),
        };
        let mapping = CoordinateMapping {
            one_based_frames: true,
            one_based_pixels: self.settings.one_based_coordinates,
        };

        let mut assigned = vec![0u32; measurements.len()];
        let mut any = false;
        for location in locations {
            if !(location >= 1.0 && location.fract() == 0.0) {
                warn!("Skipping location id {} in {}", location, folder_id);
                continue;
            }
            let stack = match self.location_labels(folder_id, location as u32).await? {
                Some(stack) => stack,
                None => continue,
            };
            any = true;
            let centroids = labels::stack_centroids(stack.view());
            let rows = table.rows_where(LOCATION_COLUMN, location)?;
            let subset: Vec<_> = rows.iter().map(|&r| measurements[r]).collect();
            for (&row, label) in rows
                .iter()
                .zip(labels::assign_labels(&subset, &centroids, mapping))
            {
                assigned[row] = label;
            }
        }
        Ok(if any { Some(assigned) } else { None })
    }

    /// A location's label stack, from its cached label bundles or by
    /// building the location. `None` when the location has no labels.
    async fn location_labels(&self, folder_id: &str, location: u32) -> Result<Option<Array3<u32>>> {
        let folder = location_folder(folder_id, location);
        if let Some(marker) = self.location_marker(&folder)? {
            if !marker.labels {
                return Ok(None);
            }
            let names: Vec<String> = (0..marker.bundles).map(label_bundle_name).collect();
            let mut complete = true;
            for name in &names {
                complete &= self.cache.is_cached(&folder, name)?;
            }
            if complete {
                let mut bundles = Vec::with_capacity(names.len());
                for name in &names {
                    bundles.push(self.cache.read(&folder, name)?);
                }
                return match labels::decode_label_bundles(&bundles) {
                    Ok(stack) => Ok(Some(stack)),
                    Err(e) => {
                        warn!("Unreadable label bundles in {}: {}", folder, e);
                        Ok(None)
                    }
                };
            }
            info!("Label bundles of {} are incomplete, rebuilding", folder);
        }
        match self.build_location(folder_id, location).await {
            Ok(built) => Ok(built.labels),
            Err(Error::NotFound(what)) => {
                info!("No label stack for {}: {}", folder, what);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Convert a location's image stack into image and label bundles, all
    /// written to the cache, plus the folder's `imageMetaData.json` if it
    /// has none yet.
    pub async fn build_location(&self, folder_id: &str, location: u32) -> Result<BuiltLocation> {
        let settings = self.settings;
        let folder = location_folder(folder_id, location);
        let data = DriveRelay::new(self.drive)
            .fetch(&folder, &settings.image_stack_filename)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("{} in {}", settings.image_stack_filename, folder))
            })?;
        info!("Building bundles for {}", folder);

        let images = matrix::as_stack(matrix::load_variable(&data, &settings.image_variable)?)?;
        let (frames, height, width) = images.dim();
        let labels = match matrix::load_optional_variable(&data, &settings.label_variable)? {
            Some(raw) => {
                let stack = labels::resolve_labels(
                    labels::to_label_stack(matrix::as_stack(raw)?.view()).view(),
                );
                if stack.dim() == images.dim() {
                    Some(stack)
                } else {
                    warn!(
                        "Ignoring labels in {}: {:?} doesn't match images {:?}",
                        folder,
                        stack.dim(),
                        images.dim()
                    );
                    None
                }
            }
            None => None,
        };

        let layout = settings.layout.for_frames(height as u32, width as u32)?;
        let frames = frames as u32;
        let normalized = tiler::normalize_to_u8(images.view());
        let overlay = LabelOverlay::from_name(&settings.label_overlay, settings.overlay_alpha);
        for bundle in 0..layout.bundle_count(frames) {
            let jpeg_name = image_bundle_name(bundle, ImageFormat::Jpeg);
            let png_name = image_bundle_name(bundle, ImageFormat::Png);
            if self.cache.is_cached(&folder, &jpeg_name)? && self.cache.is_cached(&folder, &png_name)? {
                continue;
            }
            let img = tiler::render_bundle(
                normalized.view(),
                labels.as_ref().map(|l| l.view()),
                &layout,
                bundle,
                overlay,
            )?;
            self.store_new(&folder, &jpeg_name, || {
                tiler::encode_jpeg(&img, &layout, settings.jpeg_quality)
            })?;
            self.store_new(&folder, &png_name, || {
                tiler::encode_png(&img, &layout, layout.bundle_frames(bundle, frames))
            })?;
        }
        if let Some(stack) = labels.as_ref() {
            for (bundle, blob) in labels::encode_label_bundles(stack.view(), &layout)
                .into_iter()
                .enumerate()
            {
                self.store_new(&folder, &label_bundle_name(bundle as u32), || Ok(blob))?;
            }
        }
        if !self.cache.is_cached(folder_id, IMAGE_METADATA)? {
            self.cache
                .write(folder_id, IMAGE_METADATA, &serde_json::to_vec(&layout)?)?;
        }
        let marker = LocationMarker {
            frames,
            bundles: layout.bundle_count(frames),
            labels: labels.is_some(),
        };
        self.cache
            .write_untracked(&folder, LOCATION_MARKER, &serde_json::to_vec(&marker)?)?;
        info!(
            "Built {} bundles of {} frames for {}",
            layout.bundle_count(frames),
            frames,
            folder
        );

        Ok(BuiltLocation {
            layout,
            frames,
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::mock::MockDrive;
    use crate::matrix::testing::mat_v5;
    use crate::pb;
    use prost::Message;

    /// Two 2x3 frames: one region of label 5 at the right of each frame,
    /// plus a mask region on the left of frame 2.
    fn image_stack() -> Vec<u8> {
        // (height 2, width 3, frames 2), column-major.
        let images: Vec<f64> = (0..12).map(|v| v as f64).collect();
        let mut labels = vec![0.0; 12];
        // frame 0: label 5 at column 2
        labels[4] = 5.0;
        labels[5] = 5.0;
        // frame 1: label 5 at column 2, label 2 at column 0
        labels[6] = 2.0;
        labels[7] = 2.0;
        labels[10] = 5.0;
        labels[11] = 5.0;
        mat_v5(&[
            ("images", &[2, 3, 2], &images),
            ("labels", &[2, 3, 2], &labels),
        ])
    }

    /// Rows: id, time, x, y, Mass (pg), Location ID, Frame ID (1-based x/y).
    fn track_matrix() -> Vec<u8> {
        let rows = [
            [1.0, 0.0, 3.0, 1.5, 10.0, 1.0, 1.0],
            [2.0, 1.0, 1.0, 1.5, 11.0, 1.0, 2.0],
            [3.0, 1.0, 3.0, 1.0, 12.0, 2.0, 1.0],
        ];
        let column_major: Vec<f64> = (0..7)
            .flat_map(|c| rows.iter().map(move |r| r[c]))
            .collect();
        mat_v5(&[("data_allframes", &[3, 7], &column_major)])
    }

    fn drive() -> MockDrive {
        let drive = MockDrive::default();
        drive.add("exp", "Experiment", "top", b"");
        drive.add("d1", "data1", "exp", b"");
        drive.add("stack1", "imageStack.mat", "d1", &image_stack());
        drive.add("track", "data_allframes.mat", "exp", &track_matrix());
        drive
    }

    fn settings() -> ConversionSettings {
        let mut settings = ConversionSettings::default();
        settings.layout = TileLayout::new(0, 0, 1, 1).unwrap();
        settings
    }

    #[rocket::async_test]
    async fn test_build_location_caches_every_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        let drive = drive();
        let settings = settings();
        let pipeline = Pipeline::new(&drive, &cache, &settings);

        let built = pipeline.build_location("exp", 1).await.unwrap();
        assert_eq!(2, built.frames);
        assert_eq!(TileLayout::new(3, 2, 1, 1).unwrap(), built.layout);
        for name in &["D0.jpg", "D1.jpg", "D0.png", "D1.png", "L0.pb", "L1.pb"] {
            assert!(cache.is_cached("exp/data1", name).unwrap(), "{} missing", name);
        }
        let meta: TileLayout =
            serde_json::from_slice(&cache.read("exp", IMAGE_METADATA).unwrap()).unwrap();
        assert_eq!(built.layout, meta);

        let jpeg = cache.read("exp/data1", "D1.jpg").unwrap();
        assert_eq!(Some(built.layout), tiler::jpeg_comment(&jpeg));

        let second = pb::LabelBundle::decode(&cache.read("exp/data1", "L1.pb").unwrap()[..]).unwrap();
        assert_eq!(1, second.frames[0].frame);
        assert_eq!(vec![2, 0, 5, 2, 0, 5], labels::expand_runs(&second.frames[0]));
    }

    #[rocket::async_test]
    async fn test_bundles_come_from_cache_then_drive_then_build() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        let drive = drive();
        drive.add("prebuilt", "D0.jpg", "d1", b"prebuilt jpeg");
        let settings = settings();
        let pipeline = Pipeline::new(&drive, &cache, &settings);

        let jpeg = pipeline
            .image_bundle("exp", 1, 0, ImageFormat::Jpeg)
            .await
            .unwrap();
        assert_eq!(b"prebuilt jpeg".to_vec(), jpeg);

        let png = pipeline.image_bundle("exp", 1, 1, ImageFormat::Png).await.unwrap();
        assert!(png.starts_with(b"\x89PNG"));
        // The build didn't replace the copy from the drive.
        assert_eq!(
            b"prebuilt jpeg".to_vec(),
            cache.read("exp/data1", "D0.jpg").unwrap()
        );

        // Everything else of the location was built along with the PNG.
        let downloads = drive.downloads.lock().unwrap().len();
        pipeline.label_bundle("exp", 1, 1).await.unwrap();
        match pipeline.label_bundle("exp", 1, 7).await {
            Err(Error::NotFound(_)) => (),
            other => panic!("unexpected {:?}", other.map(|d| d.len())),
        }
        assert_eq!(downloads, drive.downloads.lock().unwrap().len());
        match pipeline.image_bundle("exp", 4, 0, ImageFormat::Jpeg).await {
            Err(Error::NotFound(_)) => (),
            other => panic!("unexpected {:?}", other.map(|d| d.len())),
        }
    }

    #[rocket::async_test]
    async fn test_evicted_bundles_are_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        let drive = drive();
        let settings = settings();
        let pipeline = Pipeline::new(&drive, &cache, &settings);

        pipeline.build_location("exp", 1).await.unwrap();
        let marker: LocationMarker =
            serde_json::from_slice(&cache.read("exp/data1", LOCATION_MARKER).unwrap()).unwrap();
        assert_eq!(
            LocationMarker {
                frames: 2,
                bundles: 2,
                labels: true
            },
            marker
        );
        let original = cache.read("exp/data1", "L1.pb").unwrap();

        let location = dir.path().join("exp").join("data1");
        std::fs::remove_file(location.join("L1.pb")).unwrap();
        std::fs::remove_file(location.join("D1.jpg")).unwrap();

        assert_eq!(original, pipeline.label_bundle("exp", 1, 1).await.unwrap());
        let jpeg = pipeline
            .image_bundle("exp", 1, 1, ImageFormat::Jpeg)
            .await
            .unwrap();
        assert!(tiler::jpeg_comment(&jpeg).is_some());
        match pipeline.image_bundle("exp", 1, 2, ImageFormat::Jpeg).await {
            Err(Error::NotFound(_)) => (),
            other => panic!("unexpected {:?}", other.map(|d| d.len())),
        }

        // The CSV sees every label frame again after losing one.
        std::fs::remove_file(location.join("L1.pb")).unwrap();
        let csv = String::from_utf8(pipeline.mass_over_time_csv("exp").await.unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert!(lines[2].ends_with(",2"), "{}", lines[2]);
    }

    #[rocket::async_test]
    async fn test_csv_carries_segment_labels() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        let drive = drive();
        let settings = settings();
        let pipeline = Pipeline::new(&drive, &cache, &settings);

        let csv = String::from_utf8(pipeline.mass_over_time_csv("exp").await.unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            "id,time,x,y,Mass (pg),Location ID,Frame ID,segmentLabel",
            lines[0]
        );
        // Row 1 sits on the label-5 region of frame 1, row 2 on the label-2
        // region of frame 2; location 2 has no image stack.
        assert!(lines[1].ends_with(",5"), "{}", lines[1]);
        assert!(lines[2].ends_with(",2"), "{}", lines[2]);
        assert!(lines[3].ends_with(",0"), "{}", lines[3]);
        assert!(cache.is_cached("exp", MASS_OVER_TIME_CSV).unwrap());
    }

    #[rocket::async_test]
    async fn test_mass_over_time_pb_prefers_drive_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        let drive = drive();
        let settings = settings();
        let pipeline = Pipeline::new(&drive, &cache, &settings);

        let converted = pipeline.mass_over_time_pb("exp").await.unwrap();
        let table = pb::TrackTable::decode(&converted[..]).unwrap();
        assert_eq!("Mass (pg)", table.columns[4].name);
        assert_eq!(vec![10.0, 11.0, 12.0], table.columns[4].values);

        drive.add("viz", VIZ_METADATA_FOLDER, "exp", b"");
        drive.add("pb", MASS_OVER_TIME_PB, "viz", b"from drive");
        drive.touch("pb", chrono::Utc::now() + chrono::Duration::hours(1));
        assert_eq!(
            b"from drive".to_vec(),
            pipeline.mass_over_time_pb("exp").await.unwrap()
        );
    }

    #[rocket::async_test]
    async fn test_image_metadata_builds_first_location() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        let drive = drive();
        let settings = settings();
        let pipeline = Pipeline::new(&drive, &cache, &settings);

        let meta: serde_json::Value =
            serde_json::from_slice(&pipeline.image_metadata("exp").await.unwrap()).unwrap();
        assert_eq!(
            serde_json::json!({"tileWidth": 3, "tileHeight": 2, "numberOfColumns": 1, "tilesPerFile": 1}),
            meta
        );
    }
}
