//! Source selection.
//!
//! Picks the data streams and exactly one marker stream out of a registry,
//! either by explicit name or by stream type.

use super::SourceRegistry;
use crate::config::SourceSelection;
use crate::error::ConfigurationError;
use crate::source::types::SourceInfo;

/// Streams chosen for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedSources {
    pub data: Vec<SourceInfo>,
    pub markers: SourceInfo,
}

/// Resolve the configured selection against what the registry offers.
pub fn select_sources(
    registry: &dyn SourceRegistry,
    selection: &SourceSelection,
) -> Result<SelectedSources, ConfigurationError> {
    let data: Vec<SourceInfo> = match &selection.data_sources {
        Some(names) => registry
            .list_available(&[])
            .into_iter()
            .filter(|info| names.contains(&info.name))
            .collect(),
        None => registry.list_available(&selection.data_types),
    };

    let mut marker_candidates: Vec<SourceInfo> = match &selection.marker_source {
        Some(name) => registry
            .list_available(&[])
            .into_iter()
            .filter(|info| &info.name == name)
            .collect(),
        None => registry.list_available(&selection.marker_types),
    };

    if marker_candidates.len() > 1 {
        return Err(ConfigurationError::AmbiguousMarkerSource(
            marker_candidates.len(),
        ));
    }
    let markers = marker_candidates
        .pop()
        .ok_or(ConfigurationError::NoMarkerSource)?;

    // A stream cannot feed both roles.
    let data: Vec<SourceInfo> = data
        .into_iter()
        .filter(|info| info.name != markers.name)
        .collect();
    if data.is_empty() {
        return Err(ConfigurationError::NoDataSources);
    }
    if let Some(irregular) = data.iter().find(|info| !(info.nominal_srate > 0.0)) {
        return Err(ConfigurationError::IrregularRate(irregular.name.clone()));
    }

    tracing::info!(
        data_sources = data.len(),
        marker_source = %markers.name,
        "selected sources"
    );

    Ok(SelectedSources { data, markers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryRegistry;

    fn registry_with(markers: usize) -> MemoryRegistry {
        let mut registry = MemoryRegistry::new();
        let _ = registry.add_source(SourceInfo::new("eeg", "EEG", 4, 250.0));
        let _ = registry.add_source(SourceInfo::new("gaze", "Gaze", 2, 60.0));
        for i in 0..markers {
            let _ = registry.add_markers(SourceInfo::markers(format!("markers{i}")));
        }
        registry
    }

    #[test]
    fn test_selects_by_type() {
        let registry = registry_with(1);
        let selected = select_sources(&registry, &SourceSelection::default()).unwrap();
        assert_eq!(selected.data.len(), 1);
        assert_eq!(selected.data[0].name, "eeg");
        assert_eq!(selected.markers.name, "markers0");
    }

    #[test]
    fn test_no_marker_source() {
        let registry = registry_with(0);
        assert_eq!(
            select_sources(&registry, &SourceSelection::default()),
            Err(ConfigurationError::NoMarkerSource)
        );
    }

    #[test]
    fn test_ambiguous_marker_source() {
        let registry = registry_with(2);
        assert_eq!(
            select_sources(&registry, &SourceSelection::default()),
            Err(ConfigurationError::AmbiguousMarkerSource(2))
        );

        let selection = SourceSelection {
            marker_source: Some("markers1".to_string()),
            ..Default::default()
        };
        let selected = select_sources(&registry, &selection).unwrap();
        assert_eq!(selected.markers.name, "markers1");
    }

    #[test]
    fn test_explicit_data_sources() {
        let registry = registry_with(1);
        let selection = SourceSelection {
            data_sources: Some(vec!["eeg".to_string(), "gaze".to_string()]),
            ..Default::default()
        };
        let selected = select_sources(&registry, &selection).unwrap();
        assert_eq!(selected.data.len(), 2);
    }

    #[test]
    fn test_no_data_sources() {
        let mut registry = MemoryRegistry::new();
        let _ = registry.add_markers(SourceInfo::markers("markers"));
        assert_eq!(
            select_sources(&registry, &SourceSelection::default()),
            Err(ConfigurationError::NoDataSources)
        );
    }

    #[test]
    fn test_irregular_data_source_rejected() {
        let mut registry = MemoryRegistry::new();
        let _ = registry.add_source(SourceInfo::new("eeg", "EEG", 4, 0.0));
        let _ = registry.add_markers(SourceInfo::markers("markers"));
        assert_eq!(
            select_sources(&registry, &SourceSelection::default()),
            Err(ConfigurationError::IrregularRate("eeg".to_string()))
        );
    }
}
