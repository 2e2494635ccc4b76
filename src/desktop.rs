#![forbid(unsafe_code)]

// Desktop - current screen size and the resolutions the display supports

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::RwLock as StdRwLock;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid screen size '{0}', expected WIDTHxHEIGHT@RATE")]
pub struct ScreenSizeParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
    pub rate: u16,
}

impl FromStr for ScreenSize {
    type Err = ScreenSizeParseError;

    /// Parses `1920x1080@60`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ScreenSizeParseError(s.to_string());
        let (dims, rate) = s.trim().split_once('@').ok_or_else(err)?;
        let (width, height) = dims.split_once('x').ok_or_else(err)?;
        Ok(Self {
            width: width.trim().parse().map_err(|_| err())?,
            height: height.trim().parse().map_err(|_| err())?,
            rate: rate.trim().parse().map_err(|_| err())?,
        })
    }
}

impl std::fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.rate)
    }
}

/// One resolution with every refresh rate it supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenConfiguration {
    pub width: u32,
    pub height: u32,
    pub rates: Vec<u16>,
}

impl FromStr for ScreenConfiguration {
    type Err = ScreenSizeParseError;

    /// Parses `1920x1080@60|30`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ScreenSizeParseError(s.to_string());
        let (dims, rates) = s.trim().split_once('@').ok_or_else(err)?;
        let (width, height) = dims.split_once('x').ok_or_else(err)?;
        let rates = rates
            .split('|')
            .map(|r| r.trim().parse::<u16>().map_err(|_| err()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            width: width.trim().parse().map_err(|_| err())?,
            height: height.trim().parse().map_err(|_| err())?,
            rates,
        })
    }
}

impl ScreenConfiguration {
    pub fn sizes(&self) -> impl Iterator<Item = ScreenSize> + '_ {
        self.rates.iter().map(|&rate| ScreenSize {
            width: self.width,
            height: self.height,
            rate,
        })
    }
}

/// Read access to the shared desktop
pub struct Desktop {
    screen_size: StdRwLock<ScreenSize>,
    configurations: Vec<ScreenConfiguration>,
}

impl Desktop {
    pub fn new(screen_size: ScreenSize, configurations: Vec<ScreenConfiguration>) -> Self {
        Self {
            screen_size: StdRwLock::new(screen_size),
            configurations,
        }
    }

    pub fn screen_size(&self) -> ScreenSize {
        *self.screen_size.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_screen_size(&self, size: ScreenSize) {
        *self.screen_size.write().unwrap_or_else(|e| e.into_inner()) = size;
    }

    pub fn screen_configurations(&self) -> &[ScreenConfiguration] {
        &self.configurations
    }

    /// Every supported width/height/rate combination, flattened
    pub fn screen_sizes(&self) -> Vec<ScreenSize> {
        self.configurations.iter().flat_map(|c| c.sizes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_screen_size() {
        let size: ScreenSize = "1920x1080@60".parse().unwrap();
        assert_eq!(size, ScreenSize { width: 1920, height: 1080, rate: 60 });
        assert_eq!(size.to_string(), "1920x1080@60");

        assert!("1920x1080".parse::<ScreenSize>().is_err());
        assert!("widexhigh@60".parse::<ScreenSize>().is_err());
    }

    #[test]
    fn test_screen_sizes_flattened() {
        let desktop = Desktop::new(
            "1280x720@30".parse().unwrap(),
            vec![
                "1920x1080@60|30".parse().unwrap(),
                "1280x720@30".parse().unwrap(),
            ],
        );
        let sizes: Vec<String> = desktop.screen_sizes().iter().map(|s| s.to_string()).collect();
        assert_eq!(sizes, vec!["1920x1080@60", "1920x1080@30", "1280x720@30"]);
    }

    #[test]
    fn test_bad_rate_list_rejected() {
        assert!("1920x1080@60|fast".parse::<ScreenConfiguration>().is_err());
    }
}
