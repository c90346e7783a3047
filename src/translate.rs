//! Translation of a `docker save` image config into an OCI image config.

use crate::error::ConvertError;
use crate::legacy::{ContainerConfig, LegacyImageConfig};
use crate::manifest::ManifestEntry;
use anyhow::{Context, Result};
use oci_spec::image::{
    Arch, Config, ConfigBuilder, ImageConfiguration, ImageConfigurationBuilder, Os, RootFsBuilder,
};

/// Copies the fields present in `source` onto `config`.
///
/// Fields absent from `source` leave whatever `config` already holds.
/// Exposed ports and volumes become sorted key lists.
pub fn apply_container_config(config: &mut Config, source: &ContainerConfig) {
    if let Some(user) = &source.user {
        config.set_user(Some(user.clone()));
    }
    if let Some(ports) = &source.exposed_ports {
        config.set_exposed_ports(Some(ports.keys().cloned().collect()));
    }
    if let Some(env) = &source.env {
        config.set_env(Some(env.clone()));
    }
    if let Some(entrypoint) = &source.entrypoint {
        config.set_entrypoint(Some(entrypoint.0.clone()));
    }
    if let Some(cmd) = &source.cmd {
        config.set_cmd(Some(cmd.0.clone()));
    }
    if let Some(volumes) = &source.volumes {
        config.set_volumes(Some(volumes.keys().cloned().collect()));
    }
    if let Some(working_dir) = &source.working_dir {
        config.set_working_dir(Some(working_dir.clone()));
    }
    if let Some(labels) = &source.labels {
        config.set_labels(Some(labels.clone()));
    }
    if let Some(stop_signal) = &source.stop_signal {
        config.set_stop_signal(Some(stop_signal.clone()));
    }
}

pub fn to_oci_config(legacy: &LegacyImageConfig) -> Result<ImageConfiguration> {
    let rootfs = legacy.rootfs()?;

    let mut config = ConfigBuilder::default()
        .build()
        .context("Failed to build container config")?;
    if let Some(source) = &legacy.container_config {
        apply_container_config(&mut config, source);
    }

    let rootfs = RootFsBuilder::default()
        .typ(rootfs.typ.clone())
        .diff_ids(rootfs.diff_ids().to_vec())
        .build()
        .context("Failed to build rootfs")?;

    let mut image = ImageConfigurationBuilder::default()
        .architecture(Arch::from(legacy.architecture.as_str()))
        .os(Os::from(legacy.os.as_str()))
        .config(config)
        .rootfs(rootfs)
        .build()
        .context("Failed to build image configuration")?;

    image.set_created(legacy.created.clone());
    image.set_author(legacy.author.clone().filter(|a| !a.is_empty()));
    image.set_history(legacy.history.clone());

    Ok(image)
}

/// Fails unless the manifest entry lists one layer per diff id.
pub fn check_layer_alignment(legacy: &LegacyImageConfig, entry: &ManifestEntry) -> Result<()> {
    let diff_ids = legacy.rootfs()?.diff_ids().len();
    if diff_ids != entry.layers.len() {
        return Err(ConvertError::LayerCountMismatch {
            config: entry.config.clone(),
            layers: entry.layers.len(),
            diff_ids,
        }
        .into());
    }
    Ok(())
}
