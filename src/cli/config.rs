//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::{CliBackend, ModelArgs, ServeArgs};
use crate::config::{ModelBackend, ServiceConfig};
use anyhow::{Context, Result};
use std::path::Path;

/// Layer CLI overrides on top of the file (or default) configuration
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Load the base configuration and apply model overrides
    pub(crate) fn from_cli(config_path: Option<&Path>, args: &ModelArgs) -> Result<ServiceConfig> {
        let mut config = ServiceConfig::load(config_path).context("Failed to load configuration")?;
        Self::apply_model_args(&mut config, args);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// As [`Self::from_cli`], plus listener, worker and storage overrides
    pub(crate) fn for_serve(config_path: Option<&Path>, args: &ServeArgs) -> Result<ServiceConfig> {
        let mut config = ServiceConfig::load(config_path).context("Failed to load configuration")?;
        Self::apply_model_args(&mut config, &args.model);
        if let Some(bind) = &args.bind {
            config.server.bind_addr.clone_from(bind);
        }
        if let Some(workers) = args.workers {
            config.jobs.workers = workers;
        }
        if let Some(dir) = &args.results_dir {
            config.storage.results_dir.clone_from(dir);
        }
        if let Some(dir) = &args.uploads_dir {
            config.storage.uploads_dir.clone_from(dir);
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn apply_model_args(config: &mut ServiceConfig, args: &ModelArgs) {
        if let Some(backend) = args.backend {
            config.model.backend = match backend {
                CliBackend::Tract => ModelBackend::Tract,
                CliBackend::Heuristic => ModelBackend::Heuristic,
            };
        }
        if let Some(path) = &args.model {
            config.model.path.clone_from(path);
            // A model path without an explicit backend implies the ONNX backend
            if args.backend.is_none() {
                config.model.backend = ModelBackend::Tract;
            }
        }
        if let Some(patch_size) = args.patch_size {
            config.pipeline.patch_size = patch_size;
        }
        if let Some(parallelism) = args.parallelism {
            config.pipeline.inference_parallelism = parallelism;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_model_overrides() {
        let args = ModelArgs {
            backend: Some(CliBackend::Heuristic),
            model: None,
            patch_size: Some(256),
            parallelism: Some(2),
        };
        let config = CliConfigBuilder::from_cli(None, &args).unwrap();
        assert_eq!(config.model.backend, ModelBackend::Heuristic);
        assert_eq!(config.pipeline.patch_size, 256);
        assert_eq!(config.pipeline.inference_parallelism, 2);
    }

    #[test]
    fn test_model_path_selects_tract() {
        let args = ModelArgs {
            model: Some(PathBuf::from("weights/unet.onnx")),
            ..ModelArgs::default()
        };
        let config = CliConfigBuilder::from_cli(None, &args).unwrap();
        assert_eq!(config.model.backend, ModelBackend::Tract);
        assert_eq!(config.model.path, PathBuf::from("weights/unet.onnx"));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = ModelArgs {
            patch_size: Some(0),
            ..ModelArgs::default()
        };
        assert!(CliConfigBuilder::from_cli(None, &args).is_err());
    }

    #[test]
    fn test_serve_overrides() {
        let args = ServeArgs {
            model: ModelArgs::default(),
            bind: Some("127.0.0.1:9000".to_string()),
            workers: Some(3),
            results_dir: Some(PathBuf::from("/tmp/vegseg-results")),
            uploads_dir: None,
        };
        let config = CliConfigBuilder::for_serve(None, &args).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.jobs.workers, 3);
        assert_eq!(config.storage.results_dir, PathBuf::from("/tmp/vegseg-results"));
    }
}
