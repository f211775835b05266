use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use imagestore::{
    manifest::Platform,
    oci_layout::OciLayoutResolver,
    remote::Resolver,
    skopeo::SkopeoResolver,
    ImageService, Options, RemoveOutcome,
};

/// imgctl
#[derive(Debug, Parser)]
#[clap(name = "imgctl", version)]
pub struct App {
    #[clap(long, group = "repopath")]
    repo: Option<PathBuf>,
    #[clap(long, group = "repopath")]
    user: bool,
    #[clap(long, group = "repopath")]
    system: bool,

    /// Pull from an OCI image layout directory instead of a registry
    #[clap(long)]
    oci_layout: Option<PathBuf>,
    /// Skip TLS verification when talking to registries
    #[clap(long)]
    insecure: bool,
    /// Platform to select from multi-platform images, as os/arch[/variant]
    #[clap(long)]
    platform: Option<Platform>,
    /// Maximum number of blobs fetched at once
    #[clap(long)]
    jobs: Option<usize>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull an image and unpack it
    Pull { reference: String },
    /// Remove an image, or one tag of it
    Rmi { reference: String },
    /// List the images in the repository
    Images,
    /// Print the record of an image as JSON
    Inspect { reference: String },
    /// Print the runtime configuration of an image as JSON
    Config { reference: String },
}

fn options(args: &App) -> Options {
    let mut options = Options::default();
    if let Some(platform) = &args.platform {
        options.platform = platform.clone();
    }
    if let Some(jobs) = args.jobs {
        options.max_concurrent_fetches = jobs;
    }
    options
}

fn open<R: Resolver>(args: &App, resolver: R) -> Result<ImageService<R>> {
    let options = options(args);
    let service = if let Some(path) = &args.repo {
        ImageService::open_path_with_options(path, resolver, options)
    } else if args.system || (!args.user && rustix::process::getuid().is_root()) {
        ImageService::open_path_with_options("/var/lib/imagestore", resolver, options)
    } else {
        let home = std::env::var("HOME")?;
        ImageService::open_path_with_options(
            PathBuf::from(home).join(".var/lib/imagestore"),
            resolver,
            options,
        )
    }?;
    Ok(service)
}

async fn run<R: Resolver>(service: ImageService<R>, cmd: Command) -> Result<()> {
    match cmd {
        Command::Pull { ref reference } => {
            let pulled = service.pull_image(reference).await?;
            println!("{}", pulled.image_ref);
        }
        Command::Rmi { ref reference } => match service.remove_image(reference).await? {
            RemoveOutcome::NotFound => eprintln!("{reference}: no such image"),
            RemoveOutcome::Untagged { id, .. } => println!("untagged {reference} from {id}"),
            RemoveOutcome::Deleted { id } => println!("deleted {id}"),
        },
        Command::Images => {
            for record in service.list_images()? {
                let names = if record.repo_tags.is_empty() {
                    String::from("<none>")
                } else {
                    record.repo_tags.join(" ")
                };
                println!("{}  {:>12}  {names}", &record.id.hex()[..12], record.size);
            }
        }
        Command::Inspect { ref reference } => match service.image_status(reference)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("{reference}: no such image"),
        },
        Command::Config { ref reference } => {
            let config = service.image_config(reference)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    if let Some(dir) = &args.oci_layout {
        let service = open(&args, OciLayoutResolver::new(dir))?;
        run(service, args.cmd).await
    } else {
        let resolver = SkopeoResolver {
            insecure: args.insecure,
            ..SkopeoResolver::default()
        };
        let service = open(&args, resolver)?;
        run(service, args.cmd).await
    }
}
