use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use ptm_relight::loader::PtmLoader;
use ptm_relight::ptm::{read_file, PtmFile, PtmHeader};
use ptm_relight::renderer::{GpuContext, PtmRenderer, OFFSCREEN_FORMAT};
use ptm_relight::settings::{load_settings, LightSetting, RenderSettings};
use ptm_relight::shading::{render_reference, RenderMode};

#[derive(Debug, Parser)]
#[command(name = "ptm")]
#[command(about = "Polynomial Texture Map relighting renderer", version)]
#[command(long_version = option_env!("PTM_LONG_VERSION").unwrap_or(env!("CARGO_PKG_VERSION")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print a PTM file's header.
    Inspect {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Relight a PTM file and write the result as PNG.
    Render(RenderArgs),
}

#[derive(Debug, Args)]
struct RenderArgs {
    file: PathBuf,
    #[arg(short = 'o', long = "output")]
    output: PathBuf,
    /// YAML render preset; flags below override its values.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long, allow_negative_numbers = true)]
    light_u: Option<f32>,
    #[arg(long, allow_negative_numbers = true)]
    light_v: Option<f32>,
    /// default, specular, diffuse, normal_map or a raw index.
    #[arg(long)]
    mode: Option<RenderMode>,
    #[arg(long)]
    specular_exponent: Option<f32>,
    #[arg(long)]
    diffuse_gain: Option<f32>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Render on the CPU instead of the GPU.
    #[arg(long)]
    software: bool,
}

#[derive(Debug, Serialize)]
struct InspectReport<'a> {
    #[serde(flatten)]
    header: &'a PtmHeader,
    coefficient_planes: usize,
    has_base_color: bool,
}

fn main() -> Result<()> {
    let default_filter = "info,wgpu_hal=off,wgpu_core=off,wgpu=off,naga=off";
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect { file, json } => run_inspect(&file, json),
        Commands::Render(args) => run_render(&args),
    }
}

fn run_inspect(path: &Path, json: bool) -> Result<()> {
    let file = read_file(path)?;
    let report = InspectReport {
        header: &file.header,
        coefficient_planes: file.coefficient_planes().len(),
        has_base_color: file.base_color().is_some(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "OK: {} ({}x{}, {}, {} planes)",
        path.display(),
        file.width(),
        file.height(),
        file.format(),
        report.coefficient_planes
    );
    println!("Scale: {:?}", file.header.scale);
    println!("Bias: {:?}", file.header.bias);
    Ok(())
}

fn run_render(args: &RenderArgs) -> Result<()> {
    let settings = resolve_settings(args)?;
    let params = settings.frame_params();

    let file = PtmLoader::spawn(&args.file)?.wait()?;
    let (width, height) = output_size(args, &settings, &file);
    eprintln!(
        "[ptm] {}x{} {} -> {}x{} ({:?}, light {:.3},{:.3})",
        file.width(),
        file.height(),
        file.format(),
        width,
        height,
        params.mode,
        params.light.u,
        params.light.v
    );

    let rgba = if args.software {
        render_reference(&file, &params, width, height)?
    } else {
        let context = pollster::block_on(GpuContext::headless())?;
        eprintln!(
            "[ptm] Backend: {} ({})",
            context.capabilities.backend, context.capabilities.adapter_name
        );
        let mut renderer = PtmRenderer::new(&context, OFFSCREEN_FORMAT)?;
        renderer.load(file);
        renderer.render_rgba(&params, width, height)?
    };

    let image = image::RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| anyhow!("rendered buffer does not match {}x{}", width, height))?;
    image
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    println!("Wrote {}", args.output.display());
    Ok(())
}

fn resolve_settings(args: &RenderArgs) -> Result<RenderSettings> {
    let mut settings = match &args.settings {
        Some(path) => load_settings(path)?,
        None => RenderSettings::default(),
    };

    settings.light = LightSetting {
        u: args.light_u.unwrap_or(settings.light.u),
        v: args.light_v.unwrap_or(settings.light.v),
    };
    if let Some(mode) = args.mode {
        settings.mode = mode;
    }
    if let Some(exponent) = args.specular_exponent {
        settings.specular_exponent = exponent;
    }
    if let Some(gain) = args.diffuse_gain {
        settings.diffuse_gain = gain;
    }
    settings.validate().context("invalid render settings")?;
    Ok(settings)
}

fn output_size(args: &RenderArgs, settings: &RenderSettings, file: &PtmFile) -> (u32, u32) {
    let preset = settings.output;
    let width = args
        .width
        .or(preset.map(|size| size.width))
        .unwrap_or_else(|| file.width());
    let height = args
        .height
        .or(preset.map(|size| size.height))
        .unwrap_or_else(|| file.height());
    (width, height)
}
