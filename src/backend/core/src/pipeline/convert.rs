//! Conversions between the internal span model and OTLP protobuf types.
//!
//! The receiver flattens resource spans and scope spans into the internal
//! model; the exporter rebuilds resource groupings on the way out. Both
//! directions share this module so field mappings cannot drift apart.

use std::collections::BTreeMap;

use opentelemetry_proto::tonic::common::v1::{
    any_value, AnyValue, ArrayValue, KeyValue, KeyValueList,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{
    span::SpanKind as ProtoSpanKind, status::StatusCode as ProtoStatusCode, ResourceSpans,
    ScopeSpans, Span as ProtoSpan, Status as ProtoStatus,
};

use crate::model::{AttrValue, Span, SpanKind, SpanStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Inbound (proto -> model)
// ═══════════════════════════════════════════════════════════════════════════════

/// Flatten one `ResourceSpans` into internal spans, attaching the deployment
/// tenant identity. Invalid spans are skipped; the caller owns the counter.
pub fn flatten_resource_spans(resource_spans: ResourceSpans, tenant_id: &str) -> Vec<Span> {
    let resource_attributes: BTreeMap<String, String> = resource_spans
        .resource
        .as_ref()
        .map(|r: &Resource| {
            r.attributes
                .iter()
                .map(|kv| (kv.key.clone(), any_value_to_string(&kv.value)))
                .collect()
        })
        .unwrap_or_default();

    let service_name = resource_attributes
        .get("service.name")
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());

    let mut out = Vec::new();
    for scope_spans in resource_spans.scope_spans {
        for span in scope_spans.spans {
            out.push(proto_span_to_model(
                span,
                &service_name,
                resource_attributes.clone(),
                tenant_id,
            ));
        }
    }
    out
}

fn proto_span_to_model(
    span: ProtoSpan,
    service_name: &str,
    resource_attributes: BTreeMap<String, String>,
    tenant_id: &str,
) -> Span {
    let parent_span_id = if span.parent_span_id.is_empty() {
        None
    } else {
        Some(hex::encode(&span.parent_span_id))
    };

    let status = match span.status.as_ref().map(|s| s.code) {
        Some(code) if code == ProtoStatusCode::Error as i32 => SpanStatus::Error,
        Some(code) if code == ProtoStatusCode::Ok as i32 => SpanStatus::Ok,
        _ => SpanStatus::Unset,
    };

    let kind = match ProtoSpanKind::try_from(span.kind) {
        Ok(ProtoSpanKind::Server) => SpanKind::Server,
        Ok(ProtoSpanKind::Client) => SpanKind::Client,
        Ok(ProtoSpanKind::Producer) => SpanKind::Producer,
        Ok(ProtoSpanKind::Consumer) => SpanKind::Consumer,
        _ => SpanKind::Internal,
    };

    let attributes = span
        .attributes
        .into_iter()
        .map(|kv| (kv.key, any_value_to_attr(kv.value)))
        .collect();

    Span {
        span_id: hex::encode(&span.span_id),
        trace_id: hex::encode(&span.trace_id),
        parent_span_id,
        operation_name: span.name,
        service_name: service_name.to_string(),
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        kind,
        status,
        attributes,
        resource_attributes,
        tenant_id: tenant_id.to_string(),
    }
}

fn any_value_to_attr(value: Option<AnyValue>) -> AttrValue {
    match value.and_then(|v| v.value) {
        Some(any_value::Value::StringValue(s)) => AttrValue::Str(s),
        Some(any_value::Value::BoolValue(b)) => AttrValue::Bool(b),
        Some(any_value::Value::IntValue(i)) => AttrValue::Int(i),
        Some(any_value::Value::DoubleValue(d)) => AttrValue::Float(d),
        Some(any_value::Value::BytesValue(b)) => AttrValue::Str(hex::encode(b)),
        Some(any_value::Value::ArrayValue(arr)) => AttrValue::List(
            arr.values
                .into_iter()
                .map(|v| any_value_to_attr(Some(v)))
                .collect(),
        ),
        Some(any_value::Value::KvlistValue(kvs)) => AttrValue::Map(
            kvs.values
                .into_iter()
                .map(|kv| (kv.key, any_value_to_attr(kv.value)))
                .collect(),
        ),
        None => AttrValue::Str(String::new()),
    }
}

fn any_value_to_string(value: &Option<AnyValue>) -> String {
    match value.as_ref().and_then(|v| v.value.as_ref()) {
        Some(any_value::Value::StringValue(s)) => s.clone(),
        Some(any_value::Value::BoolValue(b)) => b.to_string(),
        Some(any_value::Value::IntValue(i)) => i.to_string(),
        Some(any_value::Value::DoubleValue(d)) => d.to_string(),
        Some(any_value::Value::BytesValue(b)) => hex::encode(b),
        _ => String::new(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outbound (model -> proto)
// ═══════════════════════════════════════════════════════════════════════════════

/// Group spans by service name into `ResourceSpans` for export.
pub fn spans_to_resource_spans(spans: Vec<Span>) -> Vec<ResourceSpans> {
    let mut by_service: BTreeMap<String, (BTreeMap<String, String>, Vec<ProtoSpan>)> =
        BTreeMap::new();

    for span in spans {
        let entry = by_service
            .entry(span.service_name.clone())
            .or_insert_with(|| (span.resource_attributes.clone(), Vec::new()));
        entry.1.push(model_span_to_proto(span));
    }

    by_service
        .into_iter()
        .map(|(service_name, (mut resource_attributes, spans))| {
            resource_attributes
                .entry("service.name".to_string())
                .or_insert(service_name);
            ResourceSpans {
                resource: Some(Resource {
                    attributes: resource_attributes
                        .into_iter()
                        .map(|(key, value)| KeyValue {
                            key,
                            value: Some(AnyValue {
                                value: Some(any_value::Value::StringValue(value)),
                            }),
                        })
                        .collect(),
                    dropped_attributes_count: 0,
                }),
                scope_spans: vec![ScopeSpans {
                    scope: None,
                    spans,
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }
        })
        .collect()
}

fn model_span_to_proto(span: Span) -> ProtoSpan {
    let kind = match span.kind {
        SpanKind::Server => ProtoSpanKind::Server,
        SpanKind::Client => ProtoSpanKind::Client,
        SpanKind::Internal => ProtoSpanKind::Internal,
        SpanKind::Producer => ProtoSpanKind::Producer,
        SpanKind::Consumer => ProtoSpanKind::Consumer,
    };

    let status_code = match span.status {
        SpanStatus::Ok => ProtoStatusCode::Ok,
        SpanStatus::Error => ProtoStatusCode::Error,
        SpanStatus::Unset => ProtoStatusCode::Unset,
    };

    ProtoSpan {
        trace_id: hex::decode(&span.trace_id).unwrap_or_default(),
        span_id: hex::decode(&span.span_id).unwrap_or_default(),
        parent_span_id: span
            .parent_span_id
            .as_deref()
            .map(|p| hex::decode(p).unwrap_or_default())
            .unwrap_or_default(),
        name: span.operation_name,
        kind: kind as i32,
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        attributes: span
            .attributes
            .into_iter()
            .map(|(key, value)| KeyValue {
                key,
                value: Some(attr_to_any_value(value)),
            })
            .collect(),
        status: Some(ProtoStatus {
            message: String::new(),
            code: status_code as i32,
        }),
        ..Default::default()
    }
}

fn attr_to_any_value(value: AttrValue) -> AnyValue {
    let inner = match value {
        AttrValue::Str(s) => any_value::Value::StringValue(s),
        AttrValue::Int(i) => any_value::Value::IntValue(i),
        AttrValue::Float(f) => any_value::Value::DoubleValue(f),
        AttrValue::Bool(b) => any_value::Value::BoolValue(b),
        AttrValue::List(items) => any_value::Value::ArrayValue(ArrayValue {
            values: items.into_iter().map(attr_to_any_value).collect(),
        }),
        AttrValue::Map(entries) => any_value::Value::KvlistValue(KeyValueList {
            values: entries
                .into_iter()
                .map(|(key, value)| KeyValue {
                    key,
                    value: Some(attr_to_any_value(value)),
                })
                .collect(),
        }),
    };
    AnyValue { value: Some(inner) }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn proto_span() -> ProtoSpan {
        ProtoSpan {
            trace_id: hex::decode("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            span_id: hex::decode("00f067aa0ba902b7").unwrap(),
            parent_span_id: Vec::new(),
            name: "payment.charge".into(),
            kind: ProtoSpanKind::Server as i32,
            start_time_unix_nano: 1_000,
            end_time_unix_nano: 2_000,
            attributes: vec![KeyValue {
                key: "amount".into(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::IntValue(1500)),
                }),
            }],
            status: Some(ProtoStatus {
                message: String::new(),
                code: ProtoStatusCode::Ok as i32,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_flatten_attaches_tenant_and_service() {
        let rs = ResourceSpans {
            resource: Some(Resource {
                attributes: vec![KeyValue {
                    key: "service.name".into(),
                    value: Some(AnyValue {
                        value: Some(any_value::Value::StringValue("payments".into())),
                    }),
                }],
                dropped_attributes_count: 0,
            }),
            scope_spans: vec![ScopeSpans {
                scope: None,
                spans: vec![proto_span()],
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        };

        let spans = flatten_resource_spans(rs, "t1");
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(span.span_id, "00f067aa0ba902b7");
        assert_eq!(span.service_name, "payments");
        assert_eq!(span.tenant_id, "t1");
        assert_eq!(span.kind, SpanKind::Server);
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.attributes["amount"], AttrValue::Int(1500));
    }

    #[test]
    fn test_round_trip_preserves_identity() {
        let rs = ResourceSpans {
            resource: None,
            scope_spans: vec![ScopeSpans {
                scope: None,
                spans: vec![proto_span()],
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        };
        let spans = flatten_resource_spans(rs, "t1");
        let original = spans[0].clone();

        let out = spans_to_resource_spans(spans);
        let back = flatten_resource_spans(out.into_iter().next().unwrap(), "t1");
        let restored = &back[0];

        assert_eq!(restored.trace_id, original.trace_id);
        assert_eq!(restored.span_id, original.span_id);
        assert_eq!(restored.operation_name, original.operation_name);
        assert_eq!(restored.start_time_unix_nano, original.start_time_unix_nano);
        assert_eq!(restored.end_time_unix_nano, original.end_time_unix_nano);
        assert_eq!(restored.attributes, original.attributes);
        assert_eq!(restored.status, original.status);
    }

    #[test]
    fn test_export_grouping_by_service() {
        let mut a = crate::model::span::tests_support::minimal_span();
        a.service_name = "svc-a".into();
        let mut b = crate::model::span::tests_support::minimal_span();
        b.service_name = "svc-b".into();
        b.span_id = "00f067aa0ba902b8".into();

        let groups = spans_to_resource_spans(vec![a, b]);
        assert_eq!(groups.len(), 2);
        for group in &groups {
            assert!(group
                .resource
                .as_ref()
                .unwrap()
                .attributes
                .iter()
                .any(|kv| kv.key == "service.name"));
        }
    }
}
