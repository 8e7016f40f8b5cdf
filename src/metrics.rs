// ============================================================================
// METRICS MODEL
// ============================================================================
// Const metrics produced by a collection pass. Descriptors are built once per
// mapping rebuild and shared by every sample through an `Arc`; samples are
// grouped into Prometheus metric families only at exposition time.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use prometheus::proto::{self, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use smallvec::SmallVec;

/// Inline capacity for label values; built-in namespaces carry at most four.
pub type LabelValues = SmallVec<[String; 8]>;

// ----------------------------------------------------------------------------
// Descriptors
// ----------------------------------------------------------------------------

/// Exposed metric type of a scalar sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Counter,
    Gauge,
    Untyped,
}

impl ValueType {
    fn proto_type(self) -> MetricType {
        match self {
            ValueType::Counter => MetricType::COUNTER,
            ValueType::Gauge => MetricType::GAUGE,
            ValueType::Untyped => MetricType::UNTYPED,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Counter => write!(f, "counter"),
            ValueType::Gauge => write!(f, "gauge"),
            ValueType::Untyped => write!(f, "untyped"),
        }
    }
}

/// Name, help text and label schema of a metric.
///
/// `variable_labels` are filled per sample; `const_labels` are fixed for the
/// server the descriptor was compiled for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDesc {
    pub name: String,
    pub help: String,
    pub variable_labels: Vec<String>,
    pub const_labels: BTreeMap<String, String>,
}

impl MetricDesc {
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        variable_labels: Vec<String>,
        const_labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            variable_labels,
            const_labels,
        }
    }
}

// ----------------------------------------------------------------------------
// Samples
// ----------------------------------------------------------------------------

/// Reconstructed histogram. Bucket counts are cumulative, keyed by upper bound.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HistogramValue {
    pub buckets: BTreeMap<OrderedFloat<f64>, u64>,
    pub sum: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricValue {
    Scalar { value_type: ValueType, value: f64 },
    Histogram(HistogramValue),
}

/// One sample ready for exposition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub desc: Arc<MetricDesc>,
    pub label_values: LabelValues,
    pub value: MetricValue,
}

impl Metric {
    pub fn scalar(desc: Arc<MetricDesc>, value_type: ValueType, value: f64, label_values: LabelValues) -> Self {
        Self {
            desc,
            label_values,
            value: MetricValue::Scalar { value_type, value },
        }
    }

    pub fn histogram(desc: Arc<MetricDesc>, histogram: HistogramValue, label_values: LabelValues) -> Self {
        Self {
            desc,
            label_values,
            value: MetricValue::Histogram(histogram),
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Scalar value, `None` for histograms
    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            MetricValue::Scalar { value, .. } => Some(*value),
            MetricValue::Histogram(_) => None,
        }
    }

    /// Look up a label value by name, variable labels first
    pub fn label(&self, name: &str) -> Option<&str> {
        self.desc
            .variable_labels
            .iter()
            .position(|l| l == name)
            .and_then(|i| self.label_values.get(i))
            .map(String::as_str)
            .or_else(|| self.desc.const_labels.get(name).map(String::as_str))
    }

    fn proto_type(&self) -> MetricType {
        match &self.value {
            MetricValue::Scalar { value_type, .. } => value_type.proto_type(),
            MetricValue::Histogram(_) => MetricType::HISTOGRAM,
        }
    }

    fn to_proto(&self) -> proto::Metric {
        let mut pairs: Vec<(&str, &str)> = self
            .desc
            .variable_labels
            .iter()
            .map(String::as_str)
            .zip(self.label_values.iter().map(String::as_str).chain(std::iter::repeat("")))
            .collect();
        pairs.extend(self.desc.const_labels.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let mut m = proto::Metric::default();
        for (name, value) in pairs {
            let mut lp = proto::LabelPair::default();
            lp.set_name(name.to_string());
            lp.set_value(value.to_string());
            m.mut_label().push(lp);
        }

        match &self.value {
            MetricValue::Scalar { value_type, value } => match value_type {
                ValueType::Counter => {
                    let mut c = proto::Counter::default();
                    c.set_value(*value);
                    m.set_counter(c);
                }
                ValueType::Gauge => {
                    let mut g = proto::Gauge::default();
                    g.set_value(*value);
                    m.set_gauge(g);
                }
                ValueType::Untyped => {
                    let mut u = proto::Untyped::default();
                    u.set_value(*value);
                    m.set_untyped(u);
                }
            },
            MetricValue::Histogram(h) => {
                let mut ph = proto::Histogram::default();
                ph.set_sample_count(h.count);
                ph.set_sample_sum(h.sum);
                for (upper, count) in &h.buckets {
                    let mut b = proto::Bucket::default();
                    b.set_upper_bound(upper.into_inner());
                    b.set_cumulative_count(*count);
                    ph.mut_bucket().push(b);
                }
                m.set_histogram(ph);
            }
        }
        m
    }
}

// ----------------------------------------------------------------------------
// Exposition
// ----------------------------------------------------------------------------

/// Group samples into metric families, sorted by name.
///
/// The family type and help text come from the first sample seen under a
/// name. Names without samples produce no family.
pub fn to_metric_families(metrics: &[Metric]) -> Vec<MetricFamily> {
    let mut families: BTreeMap<&str, MetricFamily> = BTreeMap::new();

    for metric in metrics {
        let family = families.entry(metric.name()).or_insert_with(|| {
            let mut mf = MetricFamily::default();
            mf.set_name(metric.desc.name.clone());
            mf.set_help(metric.desc.help.clone());
            mf.set_field_type(metric.proto_type());
            mf
        });
        family.mut_metric().push(metric.to_proto());
    }

    families
        .into_values()
        .filter(|mf| !mf.get_metric().is_empty())
        .collect()
}

/// Render families in the Prometheus text exposition format
pub fn render_text(families: &[MetricFamily]) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
