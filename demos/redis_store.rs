use dotenvy::dotenv;
use std::env;
use wxtoken_rs::{Auth, RedisTokenStore, WxClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 运行方式：
    //   cargo run --example redis_store --features redis
    //
    // 环境变量：
    // - REDIS_URL（默认 redis://127.0.0.1/）
    // - WX_CORP_ID, WX_CORP_SECRET
    //
    // 多实例部署时使用 Redis 共享 token，避免各实例独立拉取耗尽配额。

    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wxtoken_rs=debug".into()),
        )
        .init();

    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let corp_id = env::var("WX_CORP_ID")?;
    let corp_secret = env::var("WX_CORP_SECRET")?;

    let client = redis::Client::open(redis_url)?;
    let redis = redis::aio::ConnectionManager::new(client).await?;

    let store = RedisTokenStore::new(
        redis,
        WxClient::default(),
        Auth::Work {
            corp_id,
            corp_secret,
        },
    )
    .with_namespace("wxtoken:demo");

    let token = store.token().await?;
    println!("shared access_token 长度: {}", token.len());

    // 第二次读取命中 Redis 缓存，不再请求上游
    let again = store.token().await?;
    assert_eq!(token, again);
    println!("再次读取命中缓存");

    Ok(())
}
