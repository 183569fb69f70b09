// 日志系统初始化
//
// 库本身只通过 tracing 发日志；这里提供给宿主可选调用的
// 订阅器安装入口。重复调用安全（第二次起为空操作）。

/// 初始化日志系统
/// 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false) // 不显示 target（模块路径）
        .try_init();
}
