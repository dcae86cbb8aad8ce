//! Bridge from the `tracing` ecosystem into the engine. Hosts that already
//! emit `tracing` events can register [`EngineLayer`] with their subscriber
//! and have every event forwarded as a structured entry, target recorded
//! under the `_source` metadata key.

mod __test__;

use std::sync::Weak;
use tracing::field::{Field, Visit};
use tracing::{Event as TracingEvent, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::engine::LogEngine;
use crate::event::{Category, LogLevel, Metadata, MetadataValue};

fn map_level(level: &tracing::Level) -> LogLevel {
  match *level {
    tracing::Level::TRACE => LogLevel::Verbose,
    tracing::Level::DEBUG => LogLevel::Debug,
    tracing::Level::INFO => LogLevel::Info,
    tracing::Level::WARN => LogLevel::Warning,
    tracing::Level::ERROR => LogLevel::Error,
  }
}

/// Collects the `message` field and every structured field of one event.
#[derive(Default)]
struct FieldVisitor {
  message: Option<String>,
  fields: Metadata,
}

impl Visit for FieldVisitor {
  fn record_str(&mut self, field: &Field, value: &str) {
    if field.name() == "message" {
      self.message = Some(value.to_string());
    } else {
      self
        .fields
        .insert(field.name().to_string(), MetadataValue::from(value));
    }
  }

  fn record_i64(&mut self, field: &Field, value: i64) {
    self
      .fields
      .insert(field.name().to_string(), MetadataValue::Int(value));
  }

  fn record_u64(&mut self, field: &Field, value: u64) {
    let clamped = i64::try_from(value).unwrap_or(i64::MAX);
    self
      .fields
      .insert(field.name().to_string(), MetadataValue::Int(clamped));
  }

  fn record_f64(&mut self, field: &Field, value: f64) {
    self
      .fields
      .insert(field.name().to_string(), MetadataValue::Double(value));
  }

  fn record_bool(&mut self, field: &Field, value: bool) {
    self
      .fields
      .insert(field.name().to_string(), MetadataValue::Bool(value));
  }

  fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
    if field.name() == "message" {
      self.message = Some(format!("{:?}", value));
    } else {
      self
        .fields
        .insert(
          field.name().to_string(),
          MetadataValue::String(format!("{:?}", value)),
        );
    }
  }
}

/// A `tracing_subscriber` layer feeding the engine. Holds only a weak
/// handle; once the engine is gone the layer is a no-op.
pub struct EngineLayer {
  engine: Weak<LogEngine>,
  category: Category,
}

impl EngineLayer {
  pub fn new(engine: Weak<LogEngine>) -> Self {
    Self {
      engine,
      category: Category::app(),
    }
  }

  pub fn with_category(mut self, category: Category) -> Self {
    self.category = category;
    self
  }
}

impl<S> Layer<S> for EngineLayer
where
  S: Subscriber + for<'a> LookupSpan<'a>,
{
  fn on_event(&self, event: &TracingEvent<'_>, _ctx: Context<'_, S>) {
    let engine = match self.engine.upgrade() {
      Some(engine) => engine,
      None => return,
    };

    let metadata = event.metadata();
    // the SDK's own diagnostics must not feed back into the pipeline
    if metadata.target().starts_with("porby") {
      return;
    }

    let mut visitor = FieldVisitor::default();
    event.record(&mut visitor);
    let message = visitor.message.unwrap_or_default();
    let fields = if visitor.fields.is_empty() {
      None
    } else {
      Some(visitor.fields)
    };

    engine.forward(
      map_level(metadata.level()),
      self.category.clone(),
      &message,
      fields,
      Some(metadata.target()),
      metadata.file().unwrap_or(""),
      "",
      metadata.line().unwrap_or(0),
    );
  }
}
