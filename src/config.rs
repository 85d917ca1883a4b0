use anyhow::{Result, anyhow, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::ToSocketAddrs;
use std::path::Path;

use crate::media::{OutputSettings, SourceDescriptor};

/// Main configuration structure that can be loaded from CLI or a config file
///
/// Example configuration file content
/// # Motion recorder configuration
///
/// log_level = "info"
/// ffmpeg_log_level = "warning"
///
/// [http_server]
/// host_and_port = "0.0.0.0:8080"
///
/// [video_capture]
/// filename = "/dev/video0"
/// file_format = "v4l2"          # Optional demuxer hint
/// hw_type = "vaapi"             # Optional hardware decoder
///
/// [video_capture.demuxer_options]
/// video_size = "1280x720"
///
/// [output_files]
/// prefix = "recordings"
/// extension = ".mkv"
///
/// [output_files.video_encoder]
/// codec_name = "libx264"
/// private_options = { crf = "23" }
///
/// [background_subtractor]
/// algorithm = "knn"
///
/// [preprocess]
/// resize_factor = 0.5
/// smoothing = { name = "gaussian", kernel_size = 5, sigma = 0.0 }
///
/// [segmentation]
/// min_moving_area = 500
/// delta_without_motion = 5.0
/// recording = "on_motion"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Address of the HTTP server
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    #[serde(skip)]
    pub host_and_port: String,

    /// Video source: file path, device or URL
    #[arg(short, long)]
    #[serde(skip)]
    pub filename: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Log filter of this process, e.g. "info" or "motion_recorder=debug"
    #[arg(short, long, default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Verbosity of ffmpeg's own logging
    #[arg(long, default_value = "warning")]
    #[serde(default = "default_ffmpeg_log_level")]
    pub ffmpeg_log_level: String,

    #[arg(skip)]
    pub http_server: HttpServer,

    #[arg(skip)]
    pub video_capture: VideoCapture,

    #[arg(skip)]
    pub output_files: OutputFiles,

    #[arg(skip)]
    pub background_subtractor: BackgroundSubtractorConfig,

    #[arg(skip)]
    pub preprocess: PreprocessConfig,

    #[arg(skip)]
    pub segmentation: Segmentation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServer {
    pub host_and_port: String,
}

impl Default for HttpServer {
    fn default() -> Self {
        Self {
            host_and_port: default_host_and_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoCapture {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_format: Option<String>,
    pub demuxer_options: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFiles {
    pub prefix: String,
    pub extension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_bitrate: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<usize>,
    pub video_encoder: VideoEncoder,
    pub audio_encoder: AudioEncoder,
}

impl Default for OutputFiles {
    fn default() -> Self {
        Self {
            prefix: "recordings".to_string(),
            extension: ".mkv".to_string(),
            video_bitrate: None,
            audio_bitrate: None,
            video_encoder: VideoEncoder::default(),
            audio_encoder: AudioEncoder::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoEncoder {
    pub codec_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_type: Option<String>,
    pub private_options: BTreeMap<String, String>,
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self {
            codec_name: "libx264".to_string(),
            hw_type: None,
            private_options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEncoder {
    pub codec_name: String,
}

impl Default for AudioEncoder {
    fn default() -> Self {
        Self {
            codec_name: "aac".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Knn,
    Mog2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSubtractorConfig {
    pub algorithm: Algorithm,
    pub history: usize,
    pub dist_2_threshold: f64,
    pub var_threshold: f64,
    pub detect_shadows: bool,
}

impl Default for BackgroundSubtractorConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Knn,
            history: 500,
            dist_2_threshold: 400.0,
            var_threshold: 16.0,
            detect_shadows: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Smoothing {
    NormalizedBox {
        kernel_size: u32,
    },
    Gaussian {
        kernel_size: u32,
        #[serde(default)]
        sigma: f64,
    },
    Median {
        kernel_size: u32,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize_factor: Option<f64>,
    pub convert_to_gray: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<Smoothing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    OnMotion,
    #[default]
    Always,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Segmentation {
    pub min_moving_area: u64,
    pub delta_without_motion: f64,
    pub recording: RecordingMode,
}

impl Default for Segmentation {
    fn default() -> Self {
        Self {
            min_moving_area: 500,
            delta_without_motion: 5.0,
            recording: RecordingMode::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_and_port: default_host_and_port(),
            filename: None,
            config: None,
            log_level: default_log_level(),
            ffmpeg_log_level: default_ffmpeg_log_level(),
            http_server: HttpServer::default(),
            video_capture: VideoCapture::default(),
            output_files: OutputFiles::default(),
            background_subtractor: BackgroundSubtractorConfig::default(),
            preprocess: PreprocessConfig::default(),
            segmentation: Segmentation::default(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        // First parse CLI args
        let mut config = Config::parse();

        // If a config file is specified, load it and merge
        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        } else {
            config.apply_cli_overrides();
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file {}: {e}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.host_and_port = config.http_server.host_and_port.clone();
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(self, mut file_config: Config) -> Self {
        // The file is the base; CLI values override it when they are not default
        if self.host_and_port != default_host_and_port() {
            file_config.host_and_port = self.host_and_port;
        }
        if self.log_level != default_log_level() {
            file_config.log_level = self.log_level;
        }
        if self.ffmpeg_log_level != default_ffmpeg_log_level() {
            file_config.ffmpeg_log_level = self.ffmpeg_log_level;
        }
        if self.filename.is_some() {
            file_config.filename = self.filename;
        }
        file_config.config = self.config;
        file_config.apply_cli_overrides();
        file_config
    }

    /// Copies flattened CLI values into their sections.
    fn apply_cli_overrides(&mut self) {
        self.http_server.host_and_port = self.host_and_port.clone();
        if let Some(filename) = &self.filename {
            self.video_capture.filename = filename.clone();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.video_capture.filename.is_empty() {
            bail!("video_capture.filename is required");
        }
        let resolves = self
            .http_server
            .host_and_port
            .to_socket_addrs()
            .is_ok_and(|mut addrs| addrs.next().is_some());
        if !resolves {
            bail!(
                "http_server.host_and_port must be a bindable host:port like 0.0.0.0:8080, got '{}'",
                self.http_server.host_and_port
            );
        }
        if parse_ffmpeg_log_level(&self.ffmpeg_log_level).is_none() {
            bail!(
                "Unsupported ffmpeg_log_level: {}. Use quiet, error, warning, info, debug or trace",
                self.ffmpeg_log_level
            );
        }
        if self.output_files.video_encoder.codec_name.is_empty() {
            bail!("output_files.video_encoder.codec_name cannot be empty");
        }
        if self.output_files.audio_encoder.codec_name.is_empty() {
            bail!("output_files.audio_encoder.codec_name cannot be empty");
        }

        let subtractor = &self.background_subtractor;
        if subtractor.history == 0 {
            bail!("background_subtractor.history must be greater than 0");
        }
        match subtractor.algorithm {
            Algorithm::Knn if subtractor.dist_2_threshold <= 0.0 => {
                bail!("background_subtractor.dist_2_threshold must be greater than 0")
            }
            Algorithm::Mog2 if subtractor.var_threshold <= 0.0 => {
                bail!("background_subtractor.var_threshold must be greater than 0")
            }
            _ => {}
        }

        if let Some(factor) = self.preprocess.resize_factor
            && !(factor > 0.0 && factor.is_finite())
        {
            bail!("preprocess.resize_factor must be a positive number, got {factor}");
        }
        match self.preprocess.smoothing {
            Some(Smoothing::NormalizedBox { kernel_size }) if kernel_size == 0 => {
                bail!("normalized_box kernel_size must be greater than 0")
            }
            Some(Smoothing::Gaussian { kernel_size, .. })
                if kernel_size == 0 || kernel_size % 2 == 0 =>
            {
                bail!("gaussian kernel_size must be odd and greater than 0, got {kernel_size}")
            }
            Some(Smoothing::Median { kernel_size }) if kernel_size < 3 || kernel_size % 2 == 0 => {
                bail!("median kernel_size must be odd and greater than 1, got {kernel_size}")
            }
            _ => {}
        }

        let segmentation = &self.segmentation;
        if !(segmentation.delta_without_motion >= 0.0) {
            bail!("segmentation.delta_without_motion must not be negative");
        }

        Ok(())
    }

    /// Where and how the capture source is opened.
    pub fn source_descriptor(&self) -> SourceDescriptor {
        let capture = &self.video_capture;
        let mut source = SourceDescriptor::new(capture.filename.clone());
        source.format = capture.file_format.clone();
        source.options = capture.demuxer_options.clone();
        source.hw_type = capture.hw_type.clone();
        source
    }

    /// Encoder choices for recordings.
    pub fn output_settings(&self) -> OutputSettings {
        let output = &self.output_files;
        OutputSettings {
            video_codec: output.video_encoder.codec_name.clone(),
            video_hw_type: output.video_encoder.hw_type.clone(),
            video_options: output.video_encoder.private_options.clone(),
            video_bitrate: output.video_bitrate,
            audio_codec: output.audio_encoder.codec_name.clone(),
            audio_bitrate: output.audio_bitrate,
            container: None,
        }
    }

    pub fn ffmpeg_log_level(&self) -> ffmpeg_next::util::log::Level {
        parse_ffmpeg_log_level(&self.ffmpeg_log_level)
            .unwrap_or(ffmpeg_next::util::log::Level::Warning)
    }
}

fn parse_ffmpeg_log_level(level: &str) -> Option<ffmpeg_next::util::log::Level> {
    use ffmpeg_next::util::log::Level;
    match level {
        "quiet" => Some(Level::Quiet),
        "error" => Some(Level::Error),
        "warning" => Some(Level::Warning),
        "info" => Some(Level::Info),
        "debug" => Some(Level::Debug),
        "trace" => Some(Level::Trace),
        _ => None,
    }
}

// Default value functions
fn default_host_and_port() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ffmpeg_log_level() -> String {
    "warning".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        log_level = "debug"

        [http_server]
        host_and_port = "127.0.0.1:9000"

        [video_capture]
        filename = "/dev/video0"
        file_format = "v4l2"

        [video_capture.demuxer_options]
        video_size = "640x480"

        [output_files.video_encoder]
        codec_name = "libx265"
        private_options = { crf = "28" }

        [background_subtractor]
        algorithm = "mog2"
        var_threshold = 25.0

        [preprocess]
        resize_factor = 0.5
        smoothing = { name = "gaussian", kernel_size = 5 }

        [segmentation]
        recording = "on_motion"
    "#;

    #[test]
    fn test_parse_full_file() {
        let config = Config::from_toml(EXAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.host_and_port, "127.0.0.1:9000");
        assert_eq!(config.video_capture.file_format.as_deref(), Some("v4l2"));
        assert_eq!(
            config.video_capture.demuxer_options.get("video_size").map(String::as_str),
            Some("640x480")
        );
        assert_eq!(config.background_subtractor.algorithm, Algorithm::Mog2);
        assert_eq!(config.background_subtractor.history, 500);
        assert_eq!(
            config.preprocess.smoothing,
            Some(Smoothing::Gaussian {
                kernel_size: 5,
                sigma: 0.0
            })
        );
        assert_eq!(config.segmentation.recording, RecordingMode::OnMotion);
        assert_eq!(config.output_files.prefix, "recordings");

        let settings = config.output_settings();
        assert_eq!(settings.video_codec, "libx265");
        assert_eq!(settings.audio_codec, "aac");
        assert_eq!(settings.video_options.get("crf").map(String::as_str), Some("28"));
    }

    #[test]
    fn test_cli_values_override_file() {
        let file_config = Config::from_toml(EXAMPLE).unwrap();
        let cli = Config {
            host_and_port: "127.0.0.1:7000".to_string(),
            filename: Some("clip.mp4".to_string()),
            ..Config::default()
        };
        let merged = cli.merge_with_file(file_config);
        assert_eq!(merged.http_server.host_and_port, "127.0.0.1:7000");
        assert_eq!(merged.video_capture.filename, "clip.mp4");
        // default CLI value keeps the file's
        assert_eq!(merged.log_level, "debug");
    }

    #[test]
    fn test_missing_source_is_rejected() {
        let error = Config::default().validate().unwrap_err();
        assert!(error.to_string().contains("video_capture.filename"));
    }

    #[test]
    fn test_listen_address_accepts_host_names() {
        let mut config = Config::from_toml(EXAMPLE).unwrap();
        config.http_server.host_and_port = "localhost:8080".to_string();
        config.validate().unwrap();
        config.http_server.host_and_port = "[::1]:8080".to_string();
        config.validate().unwrap();

        config.http_server.host_and_port = "8080".to_string();
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("http_server.host_and_port"));
    }

    #[test]
    fn test_invalid_kernels_are_rejected() {
        let mut config = Config::from_toml(EXAMPLE).unwrap();
        config.preprocess.smoothing = Some(Smoothing::Median { kernel_size: 4 });
        assert!(config.validate().is_err());
        config.preprocess.smoothing = Some(Smoothing::Gaussian {
            kernel_size: 2,
            sigma: 1.0,
        });
        assert!(config.validate().is_err());
        config.preprocess.smoothing = Some(Smoothing::NormalizedBox { kernel_size: 4 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_algorithm_fails_to_parse() {
        let content = r#"
            [video_capture]
            filename = "a.mp4"
            [background_subtractor]
            algorithm = "gmg"
        "#;
        assert!(Config::from_toml(content).is_err());
    }

    #[test]
    fn test_source_descriptor_from_capture() {
        let config = Config::from_toml(EXAMPLE).unwrap();
        let source = config.source_descriptor();
        assert_eq!(source.url, "/dev/video0");
        assert_eq!(source.format.as_deref(), Some("v4l2"));
        assert!(source.require_video);
    }
}
