//! stackflow configuration
//!
//! Resolves which state backend a run uses, which app/stage it targets and
//! where the key material for secrets comes from.
//!
//! ```yaml
//! app: billing
//! stage: prod
//! store:
//!   backend: file
//!   root: .stackflow/state
//! password_env: STACKFLOW_PASSWORD
//! ```

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "STACKFLOW_CONFIG_PATH";
pub const APP_ENV: &str = "STACKFLOW_APP";
pub const STAGE_ENV: &str = "STACKFLOW_STAGE";
pub const STATE_DIR_ENV: &str = "STACKFLOW_STATE_DIR";
pub const DEFAULT_PASSWORD_ENV: &str = "STACKFLOW_PASSWORD";
const DEFAULT_STATE_ROOT: &str = ".stackflow/state";
const DEFAULT_STAGE: &str = "dev";

/// ステートストアのバックエンド設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// ローカルファイル (1 リソース = 1 JSON ファイル)
    File {
        #[serde(default = "default_state_root")]
        root: PathBuf,
    },
    /// プロセス内メモリ (テスト・dry-run 用)
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File {
            root: default_state_root(),
        }
    }
}

fn default_state_root() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_ROOT)
}

fn default_password_env() -> String {
    DEFAULT_PASSWORD_ENV.to_string()
}

/// エンジン全体の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub app: Option<String>,

    #[serde(default)]
    pub stage: Option<String>,

    #[serde(default)]
    pub store: StoreConfig,

    /// 暗号鍵 (パスワード) を読み込む環境変数名
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app: None,
            stage: None,
            store: StoreConfig::default(),
            password_env: default_password_env(),
        }
    }
}

impl EngineConfig {
    /// YAML ファイルから読み込む
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// 設定ファイルを探して読み込み、環境変数で上書きする
    ///
    /// 設定ファイルが無い場合はデフォルト設定を使う。
    pub fn discover() -> Result<Self> {
        let config = match find_config_file() {
            Ok(path) => Self::load(path)?,
            Err(ConfigError::ConfigFileNotFound) => {
                tracing::debug!("No config file found, using defaults");
                Self::default()
            }
            Err(e) => return Err(e),
        };
        Ok(config.with_env_overrides())
    }

    /// STACKFLOW_APP / STACKFLOW_STAGE / STACKFLOW_STATE_DIR を反映
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(app) = non_empty_env(APP_ENV) {
            self.app = Some(app);
        }
        if let Some(stage) = non_empty_env(STAGE_ENV) {
            self.stage = Some(stage);
        }
        if let Some(dir) = non_empty_env(STATE_DIR_ENV) {
            self.store = StoreConfig::File {
                root: PathBuf::from(dir),
            };
        }
        self
    }

    /// アプリ名 (必須)
    pub fn app_name(&self) -> Result<String> {
        self.app
            .clone()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ConfigError::Invalid("app が設定されていません".to_string()))
    }

    /// ステージ名: 設定値 → $USER → "dev"
    pub fn stage_name(&self) -> String {
        self.stage
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| non_empty_env("USER"))
            .unwrap_or_else(|| DEFAULT_STAGE.to_string())
    }

    /// 暗号鍵となるパスワードを環境変数から取得
    ///
    /// 未設定でもここではエラーにしない。シークレットを扱う時点で失敗させる。
    pub fn key_material(&self) -> Option<String> {
        non_empty_env(&self.password_env)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// プロジェクトの設定ファイルを探す
///
/// 以下の優先順位で設定ファイルを検索:
/// 1. 環境変数 STACKFLOW_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: stackflow.local.yaml, .stackflow.local.yaml, stackflow.yaml, .stackflow.yaml
/// 3. ./.stackflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/stackflow/stackflow.yaml (グローバル設定)
pub fn find_config_file() -> Result<PathBuf> {
    if let Some(config_path) = non_empty_env(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    let candidates = [
        "stackflow.local.yaml",
        ".stackflow.local.yaml",
        "stackflow.yaml",
        ".stackflow.yaml",
    ];

    for filename in &candidates {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_dir = current_dir.join(".stackflow");
    if project_dir.is_dir() {
        for filename in &candidates {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("stackflow").join("stackflow.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}
