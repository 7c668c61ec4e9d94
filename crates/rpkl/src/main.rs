//! PKL CLI - package and project dependency tooling
//!
//! # Usage
//!
//! ```text
//! rpkl project resolve [dir]             Resolve dependencies into PklProject.deps.json
//! rpkl download-package <uri>...         Download packages into the cache
//! rpkl cat <asset-uri>                   Print an asset of a package
//! rpkl resolve-import <module> <import>  Show where an import of a module resolves to
//! ```

use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use rpkl_packages::packages::WriterProgress;
use rpkl_packages::project::DEPS_FILE_NAME;
use rpkl_packages::{
    JsonProjectLoader, PackageResolver, PackageSettings, PackageUri, Project,
    ProjectDependenciesResolver, ProjectDeps, Uri,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rpkl")]
#[command(author, version, about = "PKL package resolution (Rust implementation)", long_about = None)]
struct Cli {
    #[command(flatten)]
    options: CommonOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonOptions {
    /// Settings file (defaults to ~/.pkl/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory where packages are cached
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Keep downloaded packages in memory only
    #[arg(long, global = true)]
    no_cache: bool,

    /// PEM file with additional trusted CA certificates (repeatable)
    #[arg(long = "ca-certificates", global = true)]
    ca_certificates: Vec<PathBuf>,

    /// HTTP timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Module allow-list pattern (repeatable)
    #[arg(long = "allowed-modules", global = true, value_delimiter = ',')]
    allowed_modules: Vec<String>,

    /// Resource allow-list pattern (repeatable)
    #[arg(long = "allowed-resources", global = true, value_delimiter = ',')]
    allowed_resources: Vec<String>,

    /// Restrict file access to this directory
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,

    /// Module path root for modulepath: URIs (repeatable)
    #[arg(long = "module-path", global = true)]
    module_path: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Project commands
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Download packages into the cache
    DownloadPackage {
        /// Package URIs, e.g. package://pkg.pkl-lang.org/pkl-pantry/pkl.toml@1.0.0
        #[arg(required = true)]
        packages: Vec<String>,

        /// Do not download the dependencies of the packages
        #[arg(long)]
        no_transitive: bool,
    },

    /// Print an asset of a package (directories print their listing)
    Cat {
        /// Asset URI, e.g. package://example.com/foo@1.0.0#/foo.pkl
        asset: String,

        /// Project used to resolve projectpackage: URIs
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },

    /// Show where an import of a module resolves to
    ResolveImport {
        /// URI of the importing module
        module: String,

        /// The import as written, e.g. `.../base.pkl`
        reference: String,

        /// Project used to resolve projectpackage: URIs
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Resolve dependencies and write PklProject.deps.json
    Resolve {
        /// Project directories (defaults to the current directory)
        dirs: Vec<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = load_settings(&cli.options)?;
    let security = settings.security_manager()?;
    let transport = Arc::new(settings.http_transport()?);
    let resolver = settings.package_resolver(transport, security.clone())?;

    match cli.command {
        Commands::Project {
            command: ProjectCommands::Resolve { dirs },
        } => {
            let dirs = if dirs.is_empty() {
                vec![env::current_dir()?]
            } else {
                dirs
            };
            for dir in dirs {
                resolve_project(&dir, resolver.as_ref())?;
            }
        }

        Commands::DownloadPackage {
            packages,
            no_transitive,
        } => {
            let progress = WriterProgress::new(io::stderr());
            let mut seen = HashSet::new();
            let mut queue = packages
                .iter()
                .map(|uri| PackageUri::parse(uri))
                .collect::<Result<Vec<_>, _>>()?;
            while let Some(package) = queue.pop() {
                if !seen.insert(package.base()) {
                    continue;
                }
                tracing::debug!("Downloading {}", package);
                resolver.download_package(&package, Some(&progress))?;
                if !no_transitive {
                    let (metadata, _) = resolver.get_dependency_metadata(&package, None)?;
                    for dependency in metadata.dependencies.values() {
                        let mut uri = PackageUri::parse(&dependency.uri)?;
                        uri.checksums = dependency.checksums.clone();
                        queue.push(uri);
                    }
                }
            }
        }

        Commands::Cat { asset, project_dir } => {
            let uri = Uri::parse(&asset)?;
            let keys = with_project(settings.module_keys(resolver), project_dir)?;
            let bytes = keys.read_resource(security.as_ref(), &uri)?;
            io::stdout().write_all(&bytes)?;
        }

        Commands::ResolveImport {
            module,
            reference,
            project_dir,
        } => {
            let uri = match Uri::parse(&module)? {
                uri if uri.is_absolute() => uri,
                _ => Uri::from_path(&fs::canonicalize(&module)?)?,
            };
            let keys = with_project(settings.module_keys(resolver), project_dir)?;
            let key = keys.create(&uri)?;
            let resolved = key.resolve_import(security.as_ref(), &reference)?;
            println!("{}", resolved);
        }
    }

    Ok(())
}

fn load_settings(options: &CommonOptions) -> Result<PackageSettings, Box<dyn std::error::Error>> {
    let mut settings = match options.settings {
        Some(ref path) => PackageSettings::load(path)?.with_env(),
        None => PackageSettings::load_from_pkl_home_dir()?,
    };

    if let Some(ref dir) = options.cache_dir {
        settings.cache_dir = Some(dir.clone());
    }
    if options.no_cache {
        settings.no_cache = true;
    }
    settings
        .ca_certificates
        .extend(options.ca_certificates.iter().cloned());
    if let Some(secs) = options.timeout {
        settings.http_timeout_secs = Some(secs);
    }
    if !options.allowed_modules.is_empty() {
        settings.allowed_modules = Some(options.allowed_modules.clone());
    }
    if !options.allowed_resources.is_empty() {
        settings.allowed_resources = Some(options.allowed_resources.clone());
    }
    if let Some(ref dir) = options.root_dir {
        settings.root_dir = Some(dir.clone());
    }
    settings
        .module_path
        .extend(options.module_path.iter().cloned());
    Ok(settings)
}

fn with_project(
    keys: rpkl_packages::ModuleKeys,
    project_dir: Option<PathBuf>,
) -> Result<rpkl_packages::ModuleKeys, Box<dyn std::error::Error>> {
    let start = match project_dir {
        Some(dir) => dir,
        None => env::current_dir()?,
    };
    match ProjectDeps::find_and_load(&start)? {
        Some((deps, path)) => {
            let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            Ok(keys.with_project(Arc::new(deps), dir))
        }
        None => Ok(keys),
    }
}

fn resolve_project(
    dir: &Path,
    resolver: &dyn PackageResolver,
) -> Result<(), Box<dyn std::error::Error>> {
    let project = Project::load_from_path(dir)?;
    let deps =
        ProjectDependenciesResolver::new(&project, &JsonProjectLoader, resolver, io::stderr())
            .resolve()?;
    let path = project.project_dir.join(DEPS_FILE_NAME);
    deps.save(&path)?;
    tracing::info!(
        "Resolved {} dependencies of {}",
        deps.resolved_dependencies.len(),
        project.project_dir.display()
    );
    println!("{}", path.display());
    Ok(())
}
