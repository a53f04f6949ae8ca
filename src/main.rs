use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use layerforge::compose::inspect::read_layered_document;
use layerforge::{
    cleanup_temp_file, Compression, ConversionEngine, ConvertOptions, EngineConfig, LayerExtractor, Renderer,
    VectorDocument,
};

#[derive(Parser, Debug)]
#[command(name = "layerforge", version, about = "Convert SVG documents into layered PSD files")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert an SVG document into a layered PSD file.
    Convert(ConvertArgs),
    /// Print the layers an SVG document would be split into, as JSON.
    Layers(LayersArgs),
    /// Print a JSON summary of a layered PSD file.
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Input SVG file (`-` for stdin).
    #[arg(required_unless_present = "url", conflicts_with = "url")]
    input: Option<PathBuf>,

    /// Fetch the document from an http(s) URL instead.
    #[arg(long)]
    url: Option<String>,

    /// Output PSD path. Defaults to a new file in the temp directory.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Canvas width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Canvas height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Fill colour of the merged composite (`#rrggbb`, `#rrggbbaa`, `transparent`).
    #[arg(long)]
    background: Option<String>,

    /// Store channels uncompressed.
    #[arg(long)]
    raw: bool,

    /// Rendering backend.
    #[arg(long, value_enum, default_value_t = BackendChoice::Native)]
    backend: BackendChoice,

    /// Engine configuration JSON; `LAYERFORGE_*` variables apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct LayersArgs {
    /// Input SVG file (`-` for stdin).
    input: PathBuf,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Layered PSD file.
    input: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendChoice {
    /// In-process rasterizer
    Native,
    /// Headless Chrome
    Cdp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Convert(args) => cmd_convert(args).await,
        Command::Layers(args) => cmd_layers(args),
        Command::Inspect(args) => cmd_inspect(args),
    }
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("read document from stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("read document '{}'", path.display()))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::from_env()?);
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("read config '{}'", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&raw).with_context(|| "parse config JSON")?;
    config.validate()?;
    Ok(config)
}

async fn cmd_convert(args: ConvertArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    match args.backend {
        #[cfg(feature = "native")]
        BackendChoice::Native => run_convert(layerforge::native::NativeRenderer::new(&config), config, args).await,
        #[cfg(feature = "cdp")]
        BackendChoice::Cdp => run_convert(layerforge::cdp::ChromeRenderer::new(&config)?, config, args).await,
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("backend {:?} is not compiled into this binary", other),
    }
}

async fn run_convert<R: Renderer>(renderer: R, config: EngineConfig, args: ConvertArgs) -> anyhow::Result<()> {
    let options = ConvertOptions {
        width: args.width,
        height: args.height,
        background_color: args.background.clone(),
        compression: args.raw.then_some(Compression::Raw),
    };

    let engine = ConversionEngine::new(renderer, config)?;
    let result = convert_with(&engine, &args, &options).await;
    engine.close().await?;
    let path = result?;

    let path = match args.out {
        Some(out) => move_output(&path, &out).await?,
        None => path,
    };
    println!("{}", path.display());
    Ok(())
}

async fn convert_with<R: Renderer>(
    engine: &ConversionEngine<R>,
    args: &ConvertArgs,
    options: &ConvertOptions,
) -> anyhow::Result<PathBuf> {
    if let Some(url) = &args.url {
        #[cfg(feature = "fetch")]
        return Ok(engine.convert_url_to_layered_image(url, options).await?);
        #[cfg(not(feature = "fetch"))]
        anyhow::bail!("cannot fetch {}: built without the `fetch` feature", url);
    }
    let input = args.input.as_deref().context("no input document given")?;
    let markup = read_input(input)?;
    Ok(engine.convert_document_to_layered_image(&markup, options).await?)
}

async fn move_output(from: &Path, to: &Path) -> anyhow::Result<PathBuf> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    if tokio::fs::rename(from, to).await.is_err() {
        // Different filesystem.
        tokio::fs::copy(from, to)
            .await
            .with_context(|| format!("write '{}'", to.display()))?;
        cleanup_temp_file(from);
    }
    Ok(to.to_path_buf())
}

fn cmd_layers(args: LayersArgs) -> anyhow::Result<()> {
    let document = VectorDocument::parse(read_input(&args.input)?);
    let extraction = LayerExtractor::extract_with_tier(&document);
    let summary = serde_json::json!({
        "width": document.width(),
        "height": document.height(),
        "tier": extraction.tier,
        "layers": extraction.descriptors,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> anyhow::Result<()> {
    let bytes = std::fs::read(&args.input).with_context(|| format!("read '{}'", args.input.display()))?;
    let doc = read_layered_document(&bytes).with_context(|| format!("decode '{}'", args.input.display()))?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
