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

    src/catalog.rs

    Read-only consumption of the downloaded services catalog. The catalog is
    a vendor-defined XML document listing one <service> element per
    subscription; chart subscriptions arrive as several services sharing a
    serial number and version, which are folded into one handle here.
*/

use std::collections::BTreeMap;
use std::path::Path;

use bitflags::bitflags;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("the services catalog is missing required field {0:?}")]
    MissingField(String),
    #[error("unsupported service category: {0:?}")]
    UnsupportedCategory(String),
    #[error("bad filename in the catalog: {0:?}")]
    BadFilename(String),
    #[error("the services catalog is not valid XML: {0}")]
    Xml(String),
    #[error("the services catalog has not been downloaded yet")]
    NotRefreshed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Which avionics vendor path a service programs through.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OemFlags: u8 {
        const AVIDYNE    = 0b001;
        const AVIDYNE_E2 = 0b010;
        const GARMIN     = 0b100;
    }
}

/// Media types a service can target.
pub const CARD_TYPE_SD: u32 = 2;
pub const CARD_TYPE_DATA_CARD: u32 = 7;

/// One `<media>` block of a service.
#[derive(Debug, Clone, Default)]
pub struct Media {
    fields: Vec<(String, String)>,
}

impl Media {
    fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn card_type(&self) -> Result<u32, CatalogError> {
        self.get("card_type")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CatalogError::MissingField("media/card_type".into()))
    }

    pub fn card_size_min(&self) -> Option<u64> {
        self.get("card_size_min").and_then(|v| v.parse().ok())
    }

    pub fn card_size_max(&self) -> Option<u64> {
        self.get("card_size_max").and_then(|v| v.parse().ok())
    }

    pub fn filename(&self) -> Option<&str> {
        self.get("filename")
    }
}

/// One `<service>` element, kept as its raw field list.
#[derive(Debug, Clone, Default)]
pub struct Service {
    fields: Vec<(String, String)>,
    media: Vec<Media>,
}

impl Service {
    pub fn optional_property(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn property(&self, name: &str) -> Result<&str, CatalogError> {
        self.optional_property(name)
            .ok_or_else(|| CatalogError::MissingField(name.to_string()))
    }

    pub fn media(&self) -> &[Media] {
        &self.media
    }

    fn check_filename(filename: &str) -> Result<&str, CatalogError> {
        if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
            return Err(CatalogError::BadFilename(filename.to_string()));
        }
        Ok(filename)
    }

    /// Name of the downloaded database archive.
    pub fn database_filename(&self) -> Result<&str, CatalogError> {
        Self::check_filename(self.property("filename")?)
    }

    pub fn file_size(&self) -> Result<u64, CatalogError> {
        self.property("file_size")?
            .parse()
            .map_err(|_| CatalogError::MissingField("file_size".into()))
    }

    /// Declared CRC32Q of the download, when present.
    pub fn file_crc(&self) -> Option<u32> {
        self.optional_property("file_crc")
            .and_then(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16).ok())
    }

    pub fn oem_flags(&self) -> OemFlags {
        let mut flags = OemFlags::empty();
        if self.optional_property("oem_avidyne") == Some("1") {
            flags |= OemFlags::AVIDYNE;
        }
        if self.optional_property("oem_avidyne_e2") == Some("1") {
            flags |= OemFlags::AVIDYNE_E2;
        }
        if self.optional_property("oem_garmin") == Some("1") {
            flags |= OemFlags::GARMIN;
        }
        flags
    }

    pub fn sff_filenames(&self) -> Result<Vec<String>, CatalogError> {
        let Some(names) = self.optional_property("oem_garmin_sff_filenames") else {
            return Ok(Vec::new());
        };
        if names.is_empty() {
            return Ok(Vec::new());
        }
        names
            .split(',')
            .map(|name| Self::check_filename(name).map(str::to_string))
            .collect()
    }

    pub fn fleet_ids(&self) -> Vec<String> {
        self.optional_property("fleet_ids")
            .map(|ids| {
                ids.split(',')
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn garmin_sec_id(&self) -> Result<u16, CatalogError> {
        self.property("garmin_sec_id")?
            .parse()
            .map_err(|_| CatalogError::MissingField("garmin_sec_id".into()))
    }

    /// The avionics system id, a hexadecimal value in the catalog.
    pub fn avionics_id(&self) -> Result<u64, CatalogError> {
        let raw = self.property("avionics_id")?;
        u64::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|_| CatalogError::MissingField("avionics_id".into()))
    }
}

/// A subscription as the user sees it: either one service, or the group of
/// chart coverage services billed under a single serial number.
#[derive(Debug, Clone)]
pub enum ServiceHandle {
    Simple(Service),
    ChartView(Vec<Service>),
}

impl ServiceHandle {
    pub fn primary(&self) -> &Service {
        match self {
            ServiceHandle::Simple(service) => service,
            ServiceHandle::ChartView(services) => &services[0],
        }
    }

    pub fn services(&self) -> &[Service] {
        match self {
            ServiceHandle::Simple(service) => std::slice::from_ref(service),
            ServiceHandle::ChartView(services) => services,
        }
    }

    pub fn is_chartview(&self) -> bool {
        matches!(self, ServiceHandle::ChartView(_))
    }

    pub fn optional_property(&self, name: &str) -> Option<String> {
        match self {
            ServiceHandle::Simple(service) => {
                service.optional_property(name).map(str::to_string)
            }
            ServiceHandle::ChartView(services) => {
                if name == "coverage_desc" {
                    let values: Vec<&str> = services
                        .iter()
                        .filter_map(|s| s.optional_property(name))
                        .collect();
                    Some(values.join(", "))
                } else {
                    services[0].optional_property(name).map(str::to_string)
                }
            }
        }
    }

    pub fn property(&self, name: &str) -> Result<String, CatalogError> {
        self.optional_property(name)
            .ok_or_else(|| CatalogError::MissingField(name.to_string()))
    }

    /// All database archives this subscription downloads.
    pub fn database_filenames(&self) -> Result<Vec<String>, CatalogError> {
        self.services()
            .iter()
            .map(|s| s.database_filename().map(str::to_string))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    pub services: Vec<ServiceHandle>,
}

impl Catalog {
    /// Parse the catalog file; a missing file means the catalog has not
    /// been refreshed.
    pub fn load(path: &Path) -> Result<Catalog, CatalogError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::NotRefreshed)
            }
            Err(err) => return Err(err.into()),
        };
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Catalog, CatalogError> {
        let raw_services = parse_services(text)?;

        let mut services = Vec::new();
        let mut chartview: BTreeMap<(String, String), Vec<Service>> = BTreeMap::new();

        for service in raw_services {
            let category = service
                .optional_property("category")
                .unwrap_or("1")
                .to_string();
            match category.as_str() {
                "1" | "10" => services.push(ServiceHandle::Simple(service)),
                "8" => {
                    let key = (
                        service
                            .optional_property("serial_number")
                            .unwrap_or_default()
                            .to_string(),
                        service
                            .optional_property("version")
                            .unwrap_or_default()
                            .to_string(),
                    );
                    chartview.entry(key).or_default().push(service);
                }
                // Updates to the distribution tool itself; nothing to do.
                "2" => {}
                other => return Err(CatalogError::UnsupportedCategory(other.to_string())),
            }
        }

        for (_, group) in chartview {
            services.push(ServiceHandle::ChartView(group));
        }

        Ok(Catalog { services })
    }
}

fn parse_services(text: &str) -> Result<Vec<Service>, CatalogError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut services = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut service: Option<Service> = None;
    let mut media: Option<Media> = None;
    let mut text_buf = String::new();

    loop {
        match reader.read_event().map_err(|e| CatalogError::Xml(e.to_string()))? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                path.push(name.clone());
                text_buf.clear();
                match path.len() {
                    2 if name == "service" => service = Some(Service::default()),
                    3 if name == "media" && service.is_some() => media = Some(Media::default()),
                    _ => {}
                }
            }
            Event::Text(t) => {
                text_buf = t
                    .decode()
                    .map_err(|e| CatalogError::Xml(e.to_string()))?
                    .into_owned();
            }
            Event::End(_) => {
                let name = path.pop().unwrap_or_default();
                match path.len() {
                    1 if name == "service" => {
                        if let Some(service) = service.take() {
                            services.push(service);
                        }
                    }
                    2 if name == "media" => {
                        if let (Some(service), Some(media)) = (service.as_mut(), media.take()) {
                            service.media.push(media);
                        }
                    }
                    2 => {
                        if let Some(service) = service.as_mut() {
                            service
                                .fields
                                .push((name, std::mem::take(&mut text_buf)));
                        }
                    }
                    3 => {
                        if let Some(media) = media.as_mut() {
                            media.fields.push((name, std::mem::take(&mut text_buf)));
                        }
                    }
                    _ => {}
                }
                text_buf.clear();
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match path.len() {
                    2 => {
                        if let Some(service) = service.as_mut() {
                            service.fields.push((name, String::new()));
                        }
                    }
                    3 => {
                        if let Some(media) = media.as_mut() {
                            media.fields.push((name, String::new()));
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<jdm_services>
  <response_code>0x0</response_code>
  <service>
    <category>1</category>
    <avionics>IFD440</avionics>
    <service_type>NavData</service_type>
    <unique_service_id>12345678</unique_service_id>
    <service_code>DGRW72</service_code>
    <version>2501</version>
    <display_version>2501</display_version>
    <version_start_date>2025-01-23 00:00:00</version_start_date>
    <version_end_date>2025-02-20 00:00:00</version_end_date>
    <filename>service.zip</filename>
    <file_size>1024</file_size>
    <file_crc>1234abcd</file_crc>
    <oem_avidyne_e2>1</oem_avidyne_e2>
    <fleet_ids>N100,N200</fleet_ids>
    <media>
      <card_type>2</card_type>
      <card_size_min>0</card_size_min>
      <card_size_max>33554432</card_size_max>
    </media>
  </service>
  <service>
    <category>8</category>
    <serial_number>42</serial_number>
    <version>2501</version>
    <coverage_desc>Europe</coverage_desc>
    <filename>eur_charts.zip</filename>
    <file_size>10</file_size>
  </service>
  <service>
    <category>8</category>
    <serial_number>42</serial_number>
    <version>2501</version>
    <coverage_desc>Americas</coverage_desc>
    <filename>ame_charts.zip</filename>
    <file_size>10</file_size>
  </service>
  <service>
    <category>2</category>
  </service>
</jdm_services>
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = Catalog::parse(SAMPLE).unwrap();
        assert_eq!(catalog.services.len(), 2);

        let simple = &catalog.services[0];
        assert!(!simple.is_chartview());
        assert_eq!(simple.property("avionics").unwrap(), "IFD440");
        assert_eq!(simple.primary().database_filename().unwrap(), "service.zip");
        assert_eq!(simple.primary().file_crc(), Some(0x1234_ABCD));
        assert_eq!(simple.primary().oem_flags(), OemFlags::AVIDYNE_E2);
        assert_eq!(simple.primary().fleet_ids(), vec!["N100", "N200"]);
        assert_eq!(simple.primary().media()[0].card_type().unwrap(), 2);
        assert_eq!(simple.primary().media()[0].card_size_max(), Some(33554432));

        let charts = &catalog.services[1];
        assert!(charts.is_chartview());
        assert_eq!(
            charts.database_filenames().unwrap(),
            vec!["eur_charts.zip", "ame_charts.zip"]
        );
        assert_eq!(
            charts.optional_property("coverage_desc").unwrap(),
            "Europe, Americas"
        );
    }

    #[test]
    fn test_bad_filename_rejected() {
        let mut service = Service::default();
        service
            .fields
            .push(("filename".into(), "../evil.zip".into()));
        assert!(matches!(
            service.database_filename(),
            Err(CatalogError::BadFilename(_))
        ));
    }

    #[test]
    fn test_unsupported_category() {
        let text = "<jdm_services><service><category>9</category></service></jdm_services>";
        assert!(matches!(
            Catalog::parse(text),
            Err(CatalogError::UnsupportedCategory(_))
        ));
    }
}
