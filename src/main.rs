use std::path::{Path, PathBuf};

use figment::{
    providers::{Format, Toml},
    Figment,
};
use gumdrop::Options;
use strum::{EnumMessage, IntoEnumIterator};
use tracing_subscriber::EnvFilter;

use kconftest::{
    config::Config,
    driver::Driver,
    features::{CapabilityProbe, KernelFeature, KernelProbe},
    pgsize::PageSizeModel,
    result::Reporter,
    test::TestDescriptor,
};

mod tests;

#[derive(Debug, Options)]
struct ArgOptions {
    #[options(help = "print help message")]
    help: bool,

    #[options(help = "Path of the configuration file")]
    configuration_file: Option<PathBuf>,

    #[options(no_short, help = "List registered test programs")]
    list_tests: bool,

    #[options(help = "List kernel features and whether they are supported")]
    list_features: bool,

    #[options(free, help = "Test programs to run, all of them if none is given")]
    tests: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = ArgOptions::parse_args_default_or_exit();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config: Config = Figment::new()
        .merge(Toml::file(
            args.configuration_file
                .as_deref()
                .unwrap_or(Path::new("kconftest.toml")),
        ))
        .extract()?;

    let mut descriptors: Vec<&TestDescriptor> = inventory::iter::<TestDescriptor>
        .into_iter()
        .collect();
    descriptors.sort_by_key(|descriptor| descriptor.name);

    if args.list_tests {
        for descriptor in descriptors {
            println!("{}\t{}", descriptor.name, descriptor.description);
        }
        return Ok(());
    }

    let probe = KernelProbe::new(config.features.disabled.clone());

    if args.list_features {
        for feature in KernelFeature::iter() {
            let status = if probe.supported(feature) {
                "supported"
            } else {
                "unsupported"
            };
            println!(
                "{feature}\t{status}\t{}",
                feature.get_documentation().unwrap_or_default()
            );
        }
        return Ok(());
    }

    if let Some(unknown) = args
        .tests
        .iter()
        .find(|name| !descriptors.iter().any(|descriptor| descriptor.name == name.as_str()))
    {
        anyhow::bail!("unknown test program: {unknown}");
    }
    if !args.tests.is_empty() {
        descriptors.retain(|descriptor| args.tests.iter().any(|name| name == descriptor.name));
    }

    let model = PageSizeModel::init(config.settings.kernel_page_size)?;
    tracing::debug!(?model, "page size model");

    let reporter = Reporter::global();
    let driver = Driver::new(reporter, &config, &probe);

    let mut exit_code = 0;
    for descriptor in descriptors {
        exit_code |= driver.run(descriptor).exit_code();
    }

    reporter.flush();
    std::process::exit(exit_code)
}
