//! App - アプリケーション層
//!
//! ports を組み合わせて pipeline の実行契約を実装します。
//!
//! # 主要コンポーネント
//! - **StageSpec / StageProcessor**: 1 stage の定義と domain 処理
//! - **StageWorker**: consume → decode → process → forward → settle のループ
//! - **Pipeline**: 複数 stage の検証・topology 宣言・起動
//! - **Ingress**: 最初の envelope を作って publish
//! - **HealthProbe**: worker の liveness

pub mod health;
pub mod ingress;
pub mod pipeline;
pub mod stage;
pub mod worker;

// 主要な型を再エクスポート
pub use self::health::HealthProbe;
pub use self::ingress::{INGRESS_SOURCE, Ingress};
pub use self::pipeline::{
    Pipeline, PipelineBuilder, PipelineError, PipelineHandle, PipelineSpec, WorkerHealth,
};
pub use self::stage::{InputBinding, OutputBinding, StageProcessor, StageSpec};
pub use self::worker::StageWorker;
