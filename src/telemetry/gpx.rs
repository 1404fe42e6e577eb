//! GPX 1.1 export of the position track

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::frame::protocol::SensorSample;

/// One point of a GPX track segment
#[derive(Debug, Clone, PartialEq)]
pub struct GpxPoint {
    pub lat: f32,
    pub lon: f32,
    pub ele: f32,
    pub time: DateTime<Utc>,
}

/// Single-segment GPX track
#[derive(Debug, Clone)]
pub struct GpxTrack {
    pub name: String,
    pub points: Vec<GpxPoint>,
}

impl GpxTrack {
    /// Build a track from the samples with a GNSS fix
    ///
    /// Sample timestamps are on the sensor unit's clock, so point times are
    /// the offset from the first sample added to `started_at`.
    pub fn from_samples(name: &str, started_at: DateTime<Utc>, samples: &[SensorSample]) -> Self {
        let mut valid = samples.iter().filter(|sample| sample.has_valid_gnss()).peekable();
        let origin = valid.peek().map(|sample| sample.timestamp_ms).unwrap_or(0);

        let points = valid
            .map(|sample| {
                let offset_ms = i64::from(sample.timestamp_ms.wrapping_sub(origin));
                GpxPoint {
                    lat: sample.latitude,
                    lon: sample.longitude,
                    ele: sample.altitude,
                    time: started_at + ChronoDuration::milliseconds(offset_ms),
                }
            })
            .collect();

        Self {
            name: name.to_string(),
            points,
        }
    }

    /// Render the GPX document
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<gpx version=\"1.1\" creator=\"fleet-recorder\" xmlns=\"http://www.topografix.com/GPX/1/1\">\n");
        xml.push_str("  <trk>\n");
        xml.push_str(&format!("    <name>{}</name>\n", escape(&self.name)));
        xml.push_str("    <trkseg>\n");

        for point in &self.points {
            xml.push_str(&format!("      <trkpt lat=\"{}\" lon=\"{}\">\n", point.lat, point.lon));
            xml.push_str(&format!("        <ele>{}</ele>\n", point.ele));
            xml.push_str(&format!(
                "        <time>{}</time>\n",
                point.time.format("%Y-%m-%dT%H:%M:%S%.3fZ")
            ));
            xml.push_str("      </trkpt>\n");
        }

        xml.push_str("    </trkseg>\n");
        xml.push_str("  </trk>\n");
        xml.push_str("</gpx>\n");
        xml
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(timestamp_ms: u32, latitude: f32, longitude: f32) -> SensorSample {
        SensorSample {
            timestamp_ms,
            latitude,
            longitude,
            altitude: 12.5,
            ..SensorSample::default()
        }
    }

    #[test]
    fn test_only_valid_fixes_become_points() {
        let started = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let samples = [
            sample(1000, 0.0, 0.0),
            sample(1200, 13.75, 100.5),
            sample(1700, 13.76, 100.51),
        ];

        let track = GpxTrack::from_samples("trip 42", started, &samples);

        assert_eq!(track.points.len(), 2);
        assert_eq!(track.points[0].time, started);
        assert_eq!(track.points[1].time, started + ChronoDuration::milliseconds(500));
    }

    #[test]
    fn test_xml_document() {
        let started = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let track = GpxTrack::from_samples("A&B", started, &[sample(0, 13.75, 100.5)]);
        let xml = track.to_xml();

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<name>A&amp;B</name>"));
        assert!(xml.contains("<trkpt lat=\"13.75\" lon=\"100.5\">"));
        assert!(xml.contains("<time>2025-03-01T08:00:00.000Z</time>"));
        assert!(xml.trim_end().ends_with("</gpx>"));
    }

    #[test]
    fn test_empty_track() {
        let track = GpxTrack::from_samples("empty", Utc::now(), &[]);
        assert!(track.points.is_empty());
        assert!(track.to_xml().contains("<trkseg>"));
    }
}
