// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::publish::{publish, PublishConfig},
    clap::{Arg, ArgMatches, Command},
    debian_archive::{
        archive::{Archive, VerifiedSuite},
        downloader::{
            Downloader, DownloaderConfig, ReleaseCache, DEBIAN_ARCHIVE_KEYRING, DEFAULT_MIRROR,
        },
        error::ArchiveError,
        path_reader::{FilesystemPathReader, HttpPathReader, PathReader},
        signing::{create_self_signed_key, signing_secret_key_params_builder, Keyring},
    },
    futures::StreamExt,
    log::{error, info, warn, LevelFilter},
    std::path::{Path, PathBuf},
    thiserror::Error,
};

const MIRROR_ABOUT: &str = "\
Mirror locations

Commands reading a repository accept a mirror location. If the value contains
`://`, it is parsed as a URL. Otherwise it is interpreted as a local filesystem
path.

file://
   A local filesystem path. The path component of the URL is interpreted as
   a filesystem path.

http:// and https://
   An HTTP mirror, e.g. `https://deb.debian.org/debian`.

In all cases, the location should point to the base of the Debian repository.
This is typically a directory containing `dists` and `pool` sub-directories.
";

const PUBLISH_ABOUT: &str = "\
Publish a suite of a Debian repository.

Every configured `.deb` and `.dsc` (plus the files it references) is copied
into the repository's content addressed store and linked under `pool/`.
`Packages` and `Sources` indices are then generated for every component and
architecture, a `Release` file declaring their digests is written and signed,
and `dists/<suite>` is switched over to the new content.

Indices are linked before `Release`, `Release.gpg` and `InRelease`, so a client
never sees a `Release` referencing indices that don't exist yet.

# YAML Configuration

repository (required) (string)
   Root directory of the repository. Created if missing.

suite (required) (string)
   Name of the suite. Content is published under `dists/<suite>`.

components (required) (map[string, component])
   Files to publish, keyed by component name. Each component can have the
   following keys:

   debs (optional) (list[string])
      Paths of binary packages.

   dscs (optional) (list[string])
      Paths of source package `.dsc` files. Files they reference are looked up
      next to them.

metadata (optional) (map)
   Descriptive `Release` fields: `origin`, `label`, `suite`, `version`,
   `codename`, `description`, `not_automatic`, `but_automatic_upgrades`.

signing_key (optional) (string)
   Path of an ASCII armored secret key used to sign `Release`.

signing_key_passphrase_env (optional) (string)
   Name of the environment variable holding the signing key's passphrase.

allow_unsigned (optional) (bool)
   Publish an unsigned `Release` when no signing key is configured.

hashes (optional) (list[string])
   Digests to emit. Defaults to `[md5, sha1, sha256]`.

compressions (optional) (list[string])
   Index variants to emit. Defaults to `[none, gzip, xz]`.

valid_for_days (optional) (int)
   Emit a `Valid-Until` field this many days after `Date`.

by_hash (optional) (bool)
   Also publish indices under `by-hash/` paths.

decruft (optional) (bool)
   Remove stored content no longer referenced by any path after publishing.

Relative paths are resolved against the directory of the YAML file.
";

const FETCH_ABOUT: &str = "\
Download files of a suite after verifying them.

Each PATH has the form `dists/<suite>/<file>`. The suite's `InRelease` is
fetched and verified once, then each file is downloaded and checked against
the digest `InRelease` declares for it. Verified files are written under the
destination directory, preserving PATH.

Transient failures (timeouts, connection resets, 5xx responses) are retried
with exponential backoff. Settings can be loaded from a YAML file using the
keys `parallel`, `max_transient_retries`, `mirror`, `local_mirror`, `keyring`,
`temp_dir`, `request_timeout_ms`, `retry_base_delay_ms` and
`retry_max_delay_ms`. Command line arguments take precedence.
";

#[derive(Debug, Error)]
pub enum DrtError {
    #[error("argument parsing error: {0:?}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Archive(#[from] ArchiveError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0:?}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("environment variable {0} is not set")]
    MissingEnvironment(String),

    #[error("refusing to overwrite {0}")]
    OutputExists(String),

    #[error("{0} of {1} indices failed verification")]
    VerificationFailed(usize, usize),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, DrtError>;

pub async fn run_cli() -> Result<()> {
    let default_threads = format!("{}", num_cpus::get());

    let app = Command::new("Debian Repository Tool")
        .version("0.1")
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Publish and verify Debian repositories")
        .arg_required_else_help(true);

    let app = app
        .arg(
            Arg::new("max-parallel-io")
                .long("--max-parallel-io")
                .takes_value(true)
                .default_value(&default_threads)
                .global(true)
                .help("Maximum number of parallel I/O operations to perform"),
        )
        .arg(
            Arg::new("verbose")
                .long("--verbose")
                .short('v')
                .multiple_occurrences(true)
                .global(true)
                .help("Increase logging verbosity. Can be specified multiple times"),
        );

    let mirror_arg = Arg::new("mirror")
        .long("--mirror")
        .takes_value(true)
        .help("URL or path of the repository");
    let keyring_arg = Arg::new("keyring")
        .long("--keyring")
        .takes_value(true)
        .allow_invalid_utf8(true)
        .help("Keyring trusted to sign InRelease");

    let app = app.subcommand(
        Command::new("publish")
            .about("Publish a suite from .deb and .dsc files")
            .long_about(PUBLISH_ABOUT)
            .arg(
                Arg::new("yaml-config")
                    .long("--yaml-config")
                    .takes_value(true)
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Path to a YAML file defining the suite to publish"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Verify every index of a suite against its signed InRelease")
            .arg(mirror_arg.clone().default_value(DEFAULT_MIRROR))
            .arg(keyring_arg.clone().default_value(DEBIAN_ARCHIVE_KEYRING))
            .arg(
                Arg::new("component")
                    .long("--component")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Only verify this component"),
            )
            .arg(
                Arg::new("architecture")
                    .long("--architecture")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Only verify binary indices of this architecture"),
            )
            .arg(
                Arg::new("no-sources")
                    .long("--no-sources")
                    .help("Skip Sources indices"),
            )
            .arg(
                Arg::new("suite")
                    .required(true)
                    .help("Name of the suite to verify"),
            ),
    );

    let app = app.subcommand(
        Command::new("fetch")
            .about("Download verified files of a suite")
            .long_about(FETCH_ABOUT)
            .arg(
                Arg::new("config")
                    .long("--config")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("YAML file with downloader settings"),
            )
            .arg(mirror_arg)
            .arg(
                Arg::new("local-mirror")
                    .long("--local-mirror")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .conflicts_with("mirror")
                    .help("Local mirror directory to read from"),
            )
            .arg(keyring_arg)
            .arg(
                Arg::new("dest-dir")
                    .long("--dest-dir")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .default_value(".")
                    .help("Directory to write files to"),
            )
            .arg(
                Arg::new("path")
                    .required(true)
                    .multiple_values(true)
                    .help("Paths of the form dists/<suite>/<file>"),
            ),
    );

    let app = app.subcommand(
        Command::new("generate-key")
            .about("Create a self-signed OpenPGP key pair for signing Release files")
            .arg(
                Arg::new("user-id")
                    .long("--user-id")
                    .takes_value(true)
                    .required(true)
                    .help("Primary user ID, like `Name <email>`"),
            )
            .arg(
                Arg::new("passphrase-env")
                    .long("--passphrase-env")
                    .takes_value(true)
                    .help("Environment variable holding the passphrase protecting the key"),
            )
            .arg(
                Arg::new("output-prefix")
                    .long("--output-prefix")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .default_value("signing-key")
                    .help("Writes <prefix>.asc and <prefix>.pub.asc"),
            ),
    );

    let mut app = app.subcommand(
        Command::new("mirrors").about("Print documentation about mirror locations"),
    );

    let matches = app.clone().get_matches();

    init_logging(&matches);

    match matches.subcommand() {
        Some(("publish", args)) => command_publish(args),
        Some(("verify", args)) => command_verify(args).await,
        Some(("fetch", args)) => command_fetch(args).await,
        Some(("generate-key", args)) => command_generate_key(args),
        Some(("mirrors", _)) => {
            println!("{}", MIRROR_ABOUT);
            Ok(())
        }
        Some((command, _)) => Err(DrtError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

fn init_logging(matches: &ArgMatches) {
    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
        builder.filter_module("rustls", LevelFilter::Error);
    }

    builder.init();
}

fn required_os<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a std::ffi::OsStr> {
    args.value_of_os(name).ok_or_else(|| {
        DrtError::Clap(clap::Error::raw(
            clap::ErrorKind::MissingRequiredArgument,
            format!("--{} is required", name),
        ))
    })
}

fn command_publish(args: &ArgMatches) -> Result<()> {
    let config = PublishConfig::from_path(required_os(args, "yaml-config")?)?;

    let mut pb = pbr::ProgressBar::new(config.file_count() as u64);
    pb.message("pool ");

    let report = publish(&config, Some(&mut pb))?;

    info!(
        "published {} binary and {} source packages to dists/{}",
        report.packages, report.sources, report.suite.name
    );
    for path in &report.suite.paths {
        info!("  {}", path);
    }
    if let Some(gc) = report.decruft {
        info!(
            "decrufted {} objects ({} bytes); {} remain",
            gc.objects_removed, gc.bytes_removed, gc.objects_kept
        );
    }

    Ok(())
}

/// A reader over a mirror location.
fn mirror_reader(location: &str) -> Result<Box<dyn PathReader>> {
    if let Some(path) = location.strip_prefix("file://") {
        Ok(Box::new(FilesystemPathReader::new(path)))
    } else if location.contains("://") {
        Ok(Box::new(HttpPathReader::new(location)?))
    } else {
        Ok(Box::new(FilesystemPathReader::new(location)))
    }
}

struct VerifyOptions {
    suite: String,
    components: Option<Vec<String>>,
    architectures: Option<Vec<String>>,
    sources: bool,
    max_parallel_io: usize,
}

/// An index scheduled for verification.
enum IndexJob {
    Packages { component: String, arch: String },
    Sources { component: String },
}

impl IndexJob {
    fn path(&self) -> String {
        match self {
            Self::Packages { component, arch } => format!("{}/binary-{}/Packages", component, arch),
            Self::Sources { component } => format!("{}/source/Sources", component),
        }
    }

    /// Read every entry, returning the entry count.
    async fn run<R: PathReader>(&self, suite: &VerifiedSuite<'_, R>) -> Result<usize> {
        let mut count = 0;

        match self {
            Self::Packages { component, arch } => {
                let mut reader = suite.packages_reader(component, arch).await?;
                while reader.read_entry().await?.is_some() {
                    count += 1;
                }
            }
            Self::Sources { component } => {
                let mut reader = suite.sources_reader(component).await?;
                while reader.read_entry().await?.is_some() {
                    count += 1;
                }
            }
        }

        Ok(count)
    }
}

async fn verify_suite<R: PathReader>(
    archive: &Archive<R>,
    options: &VerifyOptions,
) -> Result<()> {
    let suite = archive.suite(&options.suite).await?;

    let selected = |filter: &Option<Vec<String>>, value: &str| {
        filter
            .as_ref()
            .map(|values| values.iter().any(|v| v == value))
            .unwrap_or(true)
    };

    let mut jobs = vec![];

    for component in suite.release().components() {
        if !selected(&options.components, component) {
            continue;
        }

        for arch in suite.release().architectures() {
            if !selected(&options.architectures, arch) {
                continue;
            }

            jobs.push(IndexJob::Packages {
                component: component.to_string(),
                arch: arch.to_string(),
            });
        }

        if options.sources {
            jobs.push(IndexJob::Sources {
                component: component.to_string(),
            });
        }
    }

    // Combinations Release doesn't declare an index for are not errors.
    let jobs = jobs
        .into_iter()
        .filter(|job| match suite.select_index(&job.path()) {
            Ok(_) => true,
            Err(_) => {
                warn!("{} is not declared by Release; skipping", job.path());
                false
            }
        })
        .collect::<Vec<_>>();

    let total = jobs.len();

    let results = futures::stream::iter(jobs.iter().map(|job| {
        let suite = &suite;
        async move { (job.path(), job.run(suite).await) }
    }))
    .buffer_unordered(options.max_parallel_io.max(1))
    .collect::<Vec<_>>()
    .await;

    let mut failed = 0;
    for (path, res) in results {
        match res {
            Ok(count) => info!("{}: {} entries verified", path, count),
            Err(e) => {
                error!("{}: {}", path, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        Err(DrtError::VerificationFailed(failed, total))
    } else {
        info!("all {} indices of {} verified", total, suite.name());
        Ok(())
    }
}

async fn command_verify(args: &ArgMatches) -> Result<()> {
    let options = VerifyOptions {
        suite: args.value_of("suite").unwrap_or_default().to_string(),
        components: args
            .values_of("component")
            .map(|v| v.map(String::from).collect()),
        architectures: args
            .values_of("architecture")
            .map(|v| v.map(String::from).collect()),
        sources: !args.is_present("no-sources"),
        max_parallel_io: args.value_of_t::<usize>("max-parallel-io")?,
    };

    let keyring = Keyring::from_path(required_os(args, "keyring")?)?;
    let reader = mirror_reader(args.value_of("mirror").unwrap_or(DEFAULT_MIRROR))?;

    info!("verifying suite {} of {}", options.suite, reader.location());

    let archive = Archive::new(reader, keyring);
    verify_suite(&archive, &options).await
}

fn downloader_config(args: &ArgMatches) -> Result<DownloaderConfig> {
    let mut config = match args.value_of_os("config") {
        Some(path) => serde_yaml::from_reader(std::fs::File::open(path)?)?,
        None => DownloaderConfig::default(),
    };

    if let Some(mirror) = args.value_of("mirror") {
        config.mirror = mirror.to_string();
        config.local_mirror = None;
    }
    if let Some(path) = args.value_of_os("local-mirror") {
        config.local_mirror = Some(PathBuf::from(path));
    }
    if let Some(path) = args.value_of_os("keyring") {
        config.keyring = PathBuf::from(path);
    }
    if args.occurrences_of("max-parallel-io") > 0 {
        config.parallel = args.value_of_t::<usize>("max-parallel-io")?;
    }

    Ok(config)
}

async fn fetch_path(cache: &ReleaseCache, path: &str, dest_dir: &Path) -> Result<PathBuf> {
    let file = cache.temp_file(path).await?;

    let dest = dest_dir.join(path);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Renames fail across filesystems.
    if let Err(e) = file.persist(&dest) {
        std::fs::copy(e.file.path(), &dest)?;
    }

    Ok(dest)
}

async fn command_fetch(args: &ArgMatches) -> Result<()> {
    let config = downloader_config(args)?;
    let parallel = config.parallel.max(1);
    let dest_dir = PathBuf::from(args.value_of_os("dest-dir").unwrap_or_default());

    let cache = ReleaseCache::new(Downloader::from_config(config)?);
    info!("fetching from {}", cache.downloader().location());

    let paths = args.values_of("path").into_iter().flatten().collect::<Vec<_>>();

    let results = futures::stream::iter(paths.iter().map(|path| {
        let cache = &cache;
        let dest_dir = dest_dir.as_path();
        async move { (*path, fetch_path(cache, path, dest_dir).await) }
    }))
    .buffer_unordered(parallel)
    .collect::<Vec<_>>()
    .await;

    let mut failed = 0;
    for (path, res) in results {
        match res {
            Ok(dest) => info!("{} -> {}", path, dest.display()),
            Err(e) => {
                error!("{}: {}", path, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        Err(DrtError::VerificationFailed(failed, paths.len()))
    } else {
        Ok(())
    }
}

fn command_generate_key(args: &ArgMatches) -> Result<()> {
    let user_id = args.value_of("user-id").unwrap_or_default();
    let prefix = PathBuf::from(args.value_of_os("output-prefix").unwrap_or_default());

    let passphrase = match args.value_of("passphrase-env") {
        Some(var) => std::env::var(var).map_err(|_| DrtError::MissingEnvironment(var.to_string()))?,
        None => String::new(),
    };

    let secret_path = prefix.with_extension("asc");
    let public_path = prefix.with_extension("pub.asc");

    for path in [&secret_path, &public_path] {
        if path.exists() {
            return Err(DrtError::OutputExists(format!("{}", path.display())));
        }
    }

    let mut builder = signing_secret_key_params_builder(user_id);
    if !passphrase.is_empty() {
        builder.passphrase(Some(passphrase.clone()));
    }
    let params = builder
        .build()
        .map_err(|e| ArchiveError::Other(format!("invalid key parameters: {}", e)))?;

    info!("generating key for {}", user_id);
    let (secret, public) =
        create_self_signed_key(params, move || passphrase).map_err(ArchiveError::from)?;

    std::fs::write(
        &secret_path,
        secret.to_armored_string(None).map_err(ArchiveError::from)?,
    )?;
    std::fs::write(
        &public_path,
        public.to_armored_string(None).map_err(ArchiveError::from)?,
    )?;

    info!("wrote {}", secret_path.display());
    info!("wrote {}", public_path.display());

    Ok(())
}
