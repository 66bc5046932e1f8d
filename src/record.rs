//! The per-segment result row shared by measurement (writer) and
//! ingestion (reader).
//!
//! Column names are kept byte-compatible with existing result trees.

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::manifest::ManifestEntry;
use crate::probe::{ProbeRequest, ProbeResponse};

/// `dd-mm-yyyy_hh:mm:ss:micros`.
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y_%H:%M:%S:%6f";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    #[serde(rename = "timestamp(dd-mm-yyyy hh:mm:ss:ms)")]
    pub timestamp: String,
    #[serde(rename = "responseIP", default)]
    pub response_ip: String,
    #[serde(rename = "resp_code", deserialize_with = "csv::invalid_option")]
    pub resp_code: Option<u16>,
    /// The waiting phase. Non-numeric cells read back as `None`.
    #[serde(rename = "latency(ms)", deserialize_with = "csv::invalid_option")]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub timing_info: String,
    #[serde(rename = "responseHeaders", default)]
    pub response_headers: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub url: String,
    /// Position in the manifest's segment list. Older files lack the column.
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub segment_index: Option<u32>,
}

impl ProbeRecord {
    pub fn from_response(
        entry: &ManifestEntry,
        segment_index: u32,
        request: &ProbeRequest,
        response: &ProbeResponse,
        started_at: DateTime<Local>,
    ) -> Result<Self> {
        Ok(Self {
            timestamp: started_at.format(TIMESTAMP_FORMAT).to_string(),
            response_ip: response.peer_ip.clone(),
            resp_code: u16::try_from(response.status).ok(),
            latency_ms: Some(response.timing.waiting),
            timing_info: serde_json::to_string(&response.timing)?,
            response_headers: serde_json::to_string(&response.headers)?,
            name: entry.name.clone(),
            content: entry.content.clone(),
            quality: entry.quality.clone(),
            url: request.label(),
            segment_index: Some(segment_index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::manifest::SegmentDescriptor;
    use crate::probe::PhaseTimings;

    fn sample() -> ProbeRecord {
        let entry = ManifestEntry {
            name: "Intro".into(),
            content: "vimeo_staff".into(),
            quality: "720p".into(),
            segments: vec![SegmentDescriptor::Url("https://a/1".into())],
        };
        let request = ProbeRequest {
            url: "https://a/1".into(),
            range: Some("bytes=0-500".into()),
        };
        let mut headers = BTreeMap::new();
        headers.insert("X-Cache".to_string(), "TCP_HIT from a1 (AkamaiGHost)".to_string());
        let response = ProbeResponse {
            peer_ip: "203.0.113.9".into(),
            status: 206,
            headers,
            timing: PhaseTimings {
                dns: 1.5,
                tcp: 10.0,
                ssl: 20.0,
                initial: 31.0,
                waiting: 42.25,
                download: 0.5,
                total: 73.75,
            },
        };
        let ts = chrono::NaiveDate::from_ymd_opt(2026, 3, 7)
            .unwrap()
            .and_hms_micro_opt(9, 5, 3, 120_000)
            .unwrap()
            .and_local_timezone(Local)
            .unwrap();
        ProbeRecord::from_response(&entry, 4, &request, &response, ts).unwrap()
    }

    #[test]
    fn test_from_response() {
        let rec = sample();
        assert_eq!(rec.timestamp, "07-03-2026_09:05:03:120000");
        assert_eq!(rec.resp_code, Some(206));
        assert_eq!(rec.latency_ms, Some(42.25));
        assert_eq!(rec.url, "https://a/1 bytes=0-500");
        assert_eq!(rec.segment_index, Some(4));
        assert!(rec.response_headers.contains("\"X-Cache\""));
    }

    #[test]
    fn test_csv_columns_and_readback() {
        let mut w = csv::Writer::from_writer(Vec::new());
        w.serialize(sample()).unwrap();
        let bytes = w.into_inner().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with(
            "timestamp(dd-mm-yyyy hh:mm:ss:ms),responseIP,resp_code,latency(ms),timing_info,\
             responseHeaders,name,content,quality,url,segment_index\n"
        ));

        let mut r = csv::Reader::from_reader(bytes.as_slice());
        let back: ProbeRecord = r.deserialize().next().unwrap().unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_legacy_rows_without_index_and_bad_latency() {
        let text = "timestamp(dd-mm-yyyy hh:mm:ss:ms),responseIP,resp_code,latency(ms),timing_info,\
                    responseHeaders,name,content,quality,url\n\
                    01-01-2026_10:00:00:000001,1.2.3.4,200,n/a,{},{},v,plex,hd,https://p/1\n";
        let mut r = csv::Reader::from_reader(text.as_bytes());
        let rec: ProbeRecord = r.deserialize().next().unwrap().unwrap();
        assert_eq!(rec.latency_ms, None);
        assert_eq!(rec.segment_index, None);
        assert_eq!(rec.resp_code, Some(200));
    }
}
