// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Application manifests and the launch descriptors derived from them

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::Error;

/// An installed application's descriptor.
///
/// The manifest is immutable once parsed. Runners share it through an `Arc`, each running
///  instance holding one reference for as long as it is registered.
#[derive(Debug, Clone)]
pub struct Manifest {
    value: Value,
    app_id: String,
}

impl Manifest {
    /// Validates the JSON object, it must at least carry `public.id`
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let app_id = public(&value)
            .and_then(|public| get_str(public, "id"))
            .map(str::to_string)
            .ok_or_else(|| Error::invalid("manifest requires a string public.id"))?;

        Ok(Self { value, app_id })
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// The application identifier reported in state records, from `public.id`
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }
}

/// Everything needed to spawn one instance of an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDesc {
    /// the application directory
    pub path: PathBuf,
    /// application identifier, `id` in the manifest
    pub tag: String,
    /// content to launch, relative to `path`
    pub content: String,
    /// content type, selects how the content is launched
    pub content_type: String,
    pub name: String,
    pub width: i32,
    pub height: i32,
    /// home directory given to the application
    pub home: PathBuf,
    pub plugins: Vec<String>,
}

impl LaunchDesc {
    /// Builds the descriptor, failing with an invalid argument on any missing or mistyped field.
    pub fn from_manifest(manifest: &Manifest, home: &Path) -> Result<Self, Error> {
        let appli = manifest
            .as_value()
            .as_object()
            .ok_or_else(|| Error::invalid("manifest is not an object"))?;
        let public = public(manifest.as_value())
            .ok_or_else(|| Error::invalid("manifest has no public object"))?;

        let plugins = match appli.get("plugins") {
            None => Vec::new(),
            Some(Value::Array(plugins)) => plugins
                .iter()
                .map(|p| p.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| Error::invalid("plugins must be strings"))?,
            Some(_) => return Err(Error::invalid("plugins must be an array")),
        };

        Ok(Self {
            path: PathBuf::from(require_str(appli, "path")?),
            tag: require_str(appli, "id")?.to_string(),
            content: require_str(appli, "content")?.to_string(),
            content_type: require_str(appli, "type")?.to_string(),
            name: require_str(public, "name")?.to_string(),
            width: require_int(public, "width")?,
            height: require_int(public, "height")?,
            home: home.to_path_buf(),
            plugins,
        })
    }
}

fn public(value: &Value) -> Option<&Map<String, Value>> {
    value.get("public").and_then(Value::as_object)
}

fn get_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn require_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str, Error> {
    get_str(obj, key).ok_or_else(|| Error::invalid(format!("{} must be a string", key)))
}

fn require_int(obj: &Map<String, Value>, key: &str) -> Result<i32, Error> {
    obj.get(key)
        .and_then(Value::as_i64)
        .and_then(|i| i32::try_from(i).ok())
        .ok_or_else(|| Error::invalid(format!("{} must be an integer", key)))
}
