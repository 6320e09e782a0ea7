use dotenvy::dotenv;
use std::time::Duration;
use wxtoken_rs::registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 运行方式：
    //   cargo run --example forced_refresh
    //
    // 环境变量：WX_APPID, WX_SECRET
    //
    // 演示强制刷新：业务接口返回 40001/40014/42001 时调用一次 refresh_token，
    // 注意不要在每个请求上调用（容易放大对 token 端点的压力）。

    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wxtoken_rs=debug".into()),
        )
        .init();

    let cache = registry::mp_cache_from_env()?;

    // 等待后台任务完成首次拉取
    for _ in 0..50 {
        if cache.token().is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let before = cache.token()?;
    println!("cached token 长度: {}", before.len());

    // 模拟业务接口报 token 失效后的一次性强制刷新
    let after = cache.refresh_stale(Some(&before)).await?;
    println!("refreshed token 长度: {}", after.len());

    Ok(())
}
