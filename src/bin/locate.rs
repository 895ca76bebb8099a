use clap::Parser;
use planar_register::calib_io::load_intrinsics;
use planar_register::pipeline::Pipeline;

#[derive(Parser)]
#[command(author, version, about)]
struct LocateCli {
    /// Reference image of the printed planar target
    model_path: String,

    /// Photograph to locate the target in
    scene_path: String,

    /// Camera calibration JSON (camera_matrix + distortion)
    #[arg(short, long)]
    calibration: Option<String>,

    /// Printed width of the target in millimetres
    #[arg(short, long, default_value_t = 0.0)]
    width_mm: f64,
}

fn main() -> planar_register::Result<()> {
    env_logger::init();
    let cli = LocateCli::parse();

    let mut pipeline = Pipeline::new()?;
    pipeline.load_model(&cli.model_path)?;

    let scene = image::ImageReader::open(&cli.scene_path)
        .map_err(|e| planar_register::CoreError::FileReadFailure {
            path: cli.scene_path.clone(),
            detail: e.to_string(),
        })?
        .decode()
        .map_err(|e| planar_register::CoreError::FileReadFailure {
            path: cli.scene_path.clone(),
            detail: e.to_string(),
        })?;

    let mut solve_pose = false;
    if let Some(calib_path) = &cli.calibration {
        let camera = load_intrinsics(calib_path)?;
        let model_width_px = pipeline.frame_corners().get(1).map_or(0.0, |c| c.x as f64);
        if cli.width_mm > 0.0 && model_width_px > 0.0 {
            pipeline.set_print_scale(cli.width_mm / 1000.0 / model_width_px);
            solve_pose = true;
        }
        pipeline.set_camera(camera);
    }

    pipeline.set_matching(true);
    pipeline.set_registering(true);
    if solve_pose {
        pipeline.set_compute_pose(true);
    }
    pipeline.update(&scene)?;

    println!(
        "model keypoints: {}  scene keypoints: {}  matches: {}",
        pipeline.model_features().len(),
        pipeline.scene_features().len(),
        pipeline.matches().len()
    );
    let h = pipeline.homography();
    if h.valid {
        println!("homography:\n{:.5}", h.mat);
        println!(
            "inliers: {} (mean reprojection error {:.3} px)",
            pipeline.inliers().count(),
            pipeline.inliers().mean_error
        );
        for c in pipeline.reprojected_frame_corners() {
            println!("corner: ({:.1}, {:.1})", c.x, c.y);
        }
    } else {
        println!("no homography found");
    }
    if pipeline.registrar().pose_valid() {
        let pose = pipeline.registrar().pose();
        println!(
            "pose: t = ({:.4}, {:.4}, {:.4}) m  r = ({:.4}, {:.4}, {:.4}) rad",
            pose.x, pose.y, pose.z, pose.rx, pose.ry, pose.rz
        );
    }
    Ok(())
}
