mod export;

use cv_core::nalgebra::Point2;
use export::ExportCamera;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use log::*;
use mono_slam::{CameraIntrinsics, ExtractorKind, SlamSettings, TrackingPipeline};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(name = "mono-slam-cli", about = "Tracks a single camera through a sequence of images")]
struct Opt {
    /// The file where settings are specified.
    ///
    /// This is in the format of `mono_slam::SlamSettings`.
    #[structopt(short, long, default_value = "mono-slam-settings.json")]
    settings: PathBuf,
    /// The focal length in pixels at the original image size
    #[structopt(short, long, default_value = "225.0")]
    focal: f64,
    /// Images wider than this are scaled down to it, along with the focal length
    #[structopt(long, default_value = "1024")]
    max_width: u32,
    /// Only every nth image is processed
    #[structopt(long, default_value = "5")]
    subsample: usize,
    /// The feature extractor (AKAZE or BRIEF), overriding the settings file
    #[structopt(short, long)]
    extractor: Option<ExtractorKind>,
    /// Start a new map after this many frames in a row fail to track
    #[structopt(long)]
    reset_after: Option<usize>,
    /// The size of the camera markers in the exported PLY
    #[structopt(long, default_value = "0.1")]
    camera_size: f64,
    /// Output PLY file to deposit point cloud and camera poses
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// List of image files in capture order
    #[structopt(parse(from_os_str))]
    images: Vec<PathBuf>,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = std::fs::File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let mut settings: SlamSettings = settings.unwrap_or_default();
    if let Some(extractor) = opt.extractor {
        settings.extractor = extractor;
    }

    let mut pipeline: Option<TrackingPipeline> = None;
    let mut failures = 0;
    for path in opt.images.iter().step_by(opt.subsample.max(1)) {
        let image = match image::open(path) {
            Ok(image) => image,
            Err(e) => {
                error!("unable to load {}: {}", path.display(), e);
                continue;
            }
        };
        let original_width = image.width();
        let image = downscale(image, opt.max_width);

        if pipeline.is_none() {
            let (width, height) = image.dimensions();
            let focal = opt.focal * width as f64 / original_width as f64;
            let principal_point = Point2::new((width / 2) as f64, (height / 2) as f64);
            let intrinsics = match CameraIntrinsics::from_focal(focal, principal_point) {
                Some(intrinsics) => intrinsics,
                None => {
                    error!("focal length {} does not give a usable camera", focal);
                    return;
                }
            };
            info!(
                "tracking {}x{} images with focal length {}",
                width, height, focal
            );
            pipeline = Some(TrackingPipeline::from_settings(
                width, height, intrinsics, settings,
            ));
        }
        let pipeline = match pipeline.as_mut() {
            Some(pipeline) => pipeline,
            None => continue,
        };

        match pipeline.process_frame(&image) {
            Ok(report) => {
                failures = 0;
                debug!("{:?}", report);
            }
            Err(e) => {
                failures += 1;
                warn!("skipping {}: {}", path.display(), e);
                if opt.reset_after.map_or(false, |limit| failures >= limit) {
                    pipeline.reset();
                    failures = 0;
                }
            }
        }
    }

    let map = match pipeline {
        Some(pipeline) => pipeline.into_map(),
        None => {
            info!("no images were processed");
            return;
        }
    };
    info!(
        "finished with {} frames and {} points",
        map.frame_count(),
        map.point_count()
    );

    if let Some(path) = opt.output {
        info!("exporting the map to {}", path.display());
        let cameras = map
            .trajectory()
            .into_iter()
            .map(|pose| ExportCamera::from_pose(pose, opt.camera_size))
            .collect();
        let result = std::fs::File::create(&path)
            .and_then(|file| export::export(file, map.point_cloud(), cameras));
        if let Err(e) = result {
            error!("unable to export map: {}", e);
        }
    }
}

/// Scales an image down so it is at most `max_width` wide.
fn downscale(image: DynamicImage, max_width: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max_width || max_width == 0 {
        return image;
    }
    let new_height = (height as u64 * max_width as u64 / width as u64) as u32;
    image.resize_exact(max_width, new_height.max(1), FilterType::Triangle)
}
