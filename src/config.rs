/*
    navcard
    https://github.com/navcard/navcard

    Copyright 2025 navcard contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------
*/

//! Platform directories and the persisted user configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const APP_NAME: &str = "navcard";
const CONFIG_FILE: &str = "config.json";

/// Application data directory (downloads, catalog, firmware images).
pub fn data_dir() -> PathBuf {
    let path = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME);
    let _ = std::fs::create_dir_all(&path);
    path
}

pub fn config_dir() -> PathBuf {
    let path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME);
    let _ = std::fs::create_dir_all(&path);
    path
}

pub fn downloads_dir() -> PathBuf {
    let path = data_dir().join("downloads");
    let _ = std::fs::create_dir_all(&path);
    path
}

/// Directory holding the proprietary programmer firmware images, which are
/// distributed separately.
pub fn firmware_dir() -> PathBuf {
    let path = data_dir().join("firmware");
    let _ = std::fs::create_dir_all(&path);
    path
}

pub fn services_path() -> PathBuf {
    data_dir().join("services.xml")
}

pub fn keychain_path() -> PathBuf {
    data_dir().join("grm_feat_key.zip")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListStyles {
    pub header_style: String,
    pub odd_row_style: String,
    pub even_row_style: String,
}

impl Default for ListStyles {
    fn default() -> Self {
        ListStyles {
            header_style: "1".into(),
            odd_row_style: "33".into(),
            even_row_style: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub list: ListStyles,
}

impl Config {
    /// Load the configuration, writing the defaults on first access.
    pub fn load() -> Config {
        let path = config_dir().join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                log::warn!("ignoring malformed config {}: {}", path.display(), err);
                Config::default()
            }),
            Err(_) => {
                let config = Config::default();
                if let Ok(text) = serde_json::to_string_pretty(&config) {
                    let _ = std::fs::write(&path, text);
                }
                config
            }
        }
    }
}
