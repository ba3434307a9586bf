//! baton-core
//!
//! Staged pipeline execution over a durable broker: each stage consumes an
//! envelope, enriches it and hands it on, with manual acknowledgment so nothing is
//! lost when a worker dies halfway.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, outcome, decision, errors, dead_letter）
//! - **ports**: 抽象化レイヤー（Broker, Clock, IdGenerator, DeadLetterSink, ResultStore）
//! - **impls**: 実装（InMemoryBroker, BrokerDeadLetterSink, InMemoryResultStore）
//! - **app**: アプリケーションロジック（StageWorker, Pipeline, Ingress, HealthProbe）
//! - **config**: YAML による pipeline 定義

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
