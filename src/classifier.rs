use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::bayes::Bayes;
use crate::error::{EventError, Result};
use crate::event::{Classification, VisualEvent};
use crate::event_set::VisualEventSet;

/// Kind of feature vector the classifier was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureType {
    Hog,
    Mmap,
    Jets,
}

impl FromStr for FeatureType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hog" => Ok(FeatureType::Hog),
            "mmap" => Ok(FeatureType::Mmap),
            "jets" => Ok(FeatureType::Jets),
            other => Err(EventError::config(format!("unknown feature type '{}'", other))),
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeatureType::Hog => "hog",
            FeatureType::Mmap => "mmap",
            FeatureType::Jets => "jets",
        };
        f.write_str(name)
    }
}

pub type FeatureData = Vec<f64>;

/// One feature vector as exchanged with the feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub event_num: u32,
    pub frame_num: u32,
    pub values: FeatureData,
}

/// Feature vectors keyed by (event number, frame number).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureCollection {
    data: BTreeMap<(u32, u32), FeatureData>,
}

impl FeatureCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I: IntoIterator<Item = FeatureRecord>>(records: I) -> Self {
        let mut collection = Self::new();
        for r in records {
            collection.insert(r.event_num, r.frame_num, r.values);
        }
        collection
    }

    pub fn insert(&mut self, event_num: u32, frame_num: u32, features: FeatureData) {
        self.data.insert((event_num, frame_num), features);
    }

    pub fn get(&self, event_num: u32, frame_num: u32) -> Option<&[f64]> {
        self.data.get(&(event_num, frame_num)).map(Vec::as_slice)
    }

    /// Forget everything recorded for `event_num`.
    pub fn remove_event(&mut self, event_num: u32) {
        self.data.retain(|&(e, _), _| e != event_num);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Anything that turns a feature vector into a class label.
pub trait Classify {
    fn classify(&self, features: &[f64]) -> Result<Classification>;
}

pub struct BayesClassifier {
    bayes: Bayes,
    feature_type: FeatureType,
}

impl BayesClassifier {
    pub fn new(bayes: Bayes, feature_type: FeatureType) -> Self {
        Self { bayes, feature_type }
    }

    pub fn load<P: AsRef<Path>>(path: P, feature_type: FeatureType) -> Result<Self> {
        Ok(Self::new(Bayes::load(path)?, feature_type))
    }

    pub fn bayes(&self) -> &Bayes {
        &self.bayes
    }

    pub fn feature_type(&self) -> FeatureType {
        self.feature_type
    }

    pub fn class_name(&self, id: usize) -> Option<&str> {
        self.bayes.class_name(id)
    }

    /// Classify `features` and label `event` with the result.
    pub fn run(&self, frame_num: u32, event: &mut VisualEvent, features: &[f64]) -> Result<()> {
        let class = self.classify(features)?;
        debug!(
            "Frame {} event {} classified as {} ({:.3})",
            frame_num,
            event.event_num(),
            class.class_name,
            class.probability
        );
        event.set_classification(class);
        Ok(())
    }

    /// Label every event that has features at `frame_num`. Returns how many
    /// were classified.
    pub fn run_events(&self, frame_num: u32, events: &mut VisualEventSet, features: &FeatureCollection) -> usize {
        let mut count = 0;
        for num in events.event_numbers() {
            let Some(fv) = features.get(num, frame_num) else {
                continue;
            };
            let Some(event) = events.event_by_number_mut(num) else {
                continue;
            };
            if event.observation_at(frame_num).is_none() {
                continue;
            }
            match self.run(frame_num, event, fv) {
                Ok(()) => count += 1,
                Err(e) => warn!("Could not classify event {}: {}", num, e),
            }
        }
        count
    }
}

impl Classify for BayesClassifier {
    fn classify(&self, features: &[f64]) -> Result<Classification> {
        let (class_id, probability) = self.bayes.classify(features)?;
        let class_name = self
            .bayes
            .class_name(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class{}", class_id));
        Ok(Classification {
            class_id,
            class_name,
            probability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_object::BitObject;
    use crate::config::{DetectionParameters, TrackingMode};
    use crate::event_set::FrameContext;
    use image::RgbImage;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn square(left: i32, top: i32, size: i32) -> BitObject {
        BitObject::from_pixels((top..top + size).flat_map(|y| (left..left + size).map(move |x| (x, y))))
    }

    fn classifier() -> BayesClassifier {
        let mut bayes = Bayes::new(1, 0);
        for v in [1.0, 1.5, 0.5] {
            bayes.learn_named(&[v], "copepod").unwrap();
        }
        for v in [9.0, 10.0, 11.0] {
            bayes.learn_named(&[v], "jelly").unwrap();
        }
        BayesClassifier::new(bayes, FeatureType::Hog)
    }

    #[test]
    fn test_feature_type_parse() {
        assert_eq!("HOG".parse::<FeatureType>().unwrap(), FeatureType::Hog);
        assert_eq!(FeatureType::Jets.to_string(), "jets");
        assert!("sift".parse::<FeatureType>().is_err());
    }

    #[test]
    fn test_feature_collection() {
        let mut features = FeatureCollection::new();
        features.insert(1, 5, vec![1.0]);
        features.insert(2, 5, vec![2.0]);
        assert_eq!(features.get(1, 5), Some(&[1.0][..]));
        assert_eq!(features.get(1, 6), None);
        features.remove_event(1);
        assert_eq!(features.len(), 1);

        let parsed: Vec<FeatureRecord> =
            serde_json::from_str(r#"[{"event_num": 3, "frame_num": 7, "values": [0.5, 1.5]}]"#).unwrap();
        let features = FeatureCollection::from_records(parsed);
        assert_eq!(features.get(3, 7), Some(&[0.5, 1.5][..]));
    }

    #[test]
    fn test_run_labels_event() {
        let c = classifier();
        let mut event = VisualEvent::new(0, 3, square(0, 0, 4), TrackingMode::NearestNeighbor);
        c.run(3, &mut event, &[10.2]).unwrap();
        let class = event.classification().unwrap();
        assert_eq!(class.class_name, "jelly");
        assert!(class.probability > 0.9);
        assert!(c.run(3, &mut event, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_run_events_and_update_hook() {
        let c = classifier();
        let params = Arc::new(DetectionParameters {
            tracking_mode: TrackingMode::NearestNeighbor,
            ..Default::default()
        });
        let mut events = VisualEventSet::new(params, "clip");
        let img = RgbImage::new(64, 64);
        let mut features = FeatureCollection::new();
        features.insert(0, 0, vec![1.2]);
        let classify: &dyn Classify = &c;
        events.update_events(
            &FrameContext::new(0, &img),
            &[square(10, 10, 4)],
            Some(classify),
            Some(&features),
        );
        assert_eq!(
            events.event_by_number(0).unwrap().classification().unwrap().class_name,
            "copepod"
        );

        features.insert(0, 0, vec![9.5]);
        assert_eq!(c.run_events(0, &mut events, &features), 1);
        assert_eq!(c.run_events(1, &mut events, &features), 0);
        assert_eq!(
            events.event_by_number(0).unwrap().token_at(0).unwrap().class_name.as_deref(),
            Some("jelly")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bayes.json");
        classifier().bayes().save(&path).unwrap();
        let loaded = BayesClassifier::load(&path, FeatureType::Mmap).unwrap();
        assert_eq!(loaded.feature_type(), FeatureType::Mmap);
        assert_eq!(loaded.class_name(1), Some("jelly"));
    }
}
