//! DNS observations from Zeek (Bro) JSON `dns.log` lines

use serde::Deserialize;

/// One DNS exchange as seen on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct DnsObservation {
    /// Unix seconds
    pub ts: i64,
    pub query: String,
    pub qtype: String,
    pub answers: Vec<String>,
    /// Parallel to `answers`; missing entries default to 0.
    pub ttls: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct ZeekDnsRecord {
    ts: f64,
    query: Option<String>,
    qtype_name: Option<String>,
    answers: Option<Vec<String>>,
    #[serde(rename = "TTLs")]
    ttls: Option<Vec<f64>>,
}

impl DnsObservation {
    /// Parse one JSON `dns.log` line.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        let rec: ZeekDnsRecord = serde_json::from_str(line)?;

        Ok(Self {
            ts: rec.ts.trunc() as i64,
            query: rec.query.unwrap_or_default(),
            qtype: rec.qtype_name.unwrap_or_else(|| "-".to_string()),
            answers: rec.answers.unwrap_or_default(),
            ttls: rec
                .ttls
                .unwrap_or_default()
                .into_iter()
                .map(|t| if t <= 0.0 { 0 } else { t.min(u32::MAX as f64) as u32 })
                .collect(),
        })
    }

    /// TTL recorded for answer `idx`, saturated to 16 bits
    pub fn ttl_at(&self, idx: usize) -> u16 {
        self.ttls
            .get(idx)
            .map(|t| (*t).min(u16::MAX as u32) as u16)
            .unwrap_or(0)
    }
}

/// Record types whose Zeek answers are host names or addresses
const NAME_ANSWER_TYPES: [&str; 8] = ["A", "AAAA", "CNAME", "DNAME", "MX", "NS", "PTR", "SRV"];

/// Lower-case and drop one trailing root dot.
pub fn normalize_name(name: &str) -> String {
    let name = name.trim();
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_lowercase()
}

pub fn answer_is_name(qtype: &str) -> bool {
    NAME_ANSWER_TYPES.iter().any(|t| t.eq_ignore_ascii_case(qtype))
}

/// Normalize host-name answers; other rdata (TXT, SOA, ...) is kept as logged.
pub fn normalize_answer(qtype: &str, answer: &str) -> String {
    if answer_is_name(qtype) {
        normalize_name(answer)
    } else {
        answer.to_string()
    }
}
