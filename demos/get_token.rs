use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use wxtoken_rs::{Auth, TokenCache, WxClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 运行方式：
    //   cargo run --example get_token
    //
    // 环境变量：
    // - 公众号 / 小程序：WX_APPID, WX_SECRET
    // - 企业微信：WX_CORP_ID, WX_CORP_SECRET
    //
    // 如两类变量均已设置，将分别启动两个独立的 TokenCache（每个身份一个）。

    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wxtoken_rs=debug".into()),
        )
        .init();

    let mut caches = Vec::new();

    if let (Ok(appid), Ok(secret)) = (env::var("WX_APPID"), env::var("WX_SECRET")) {
        println!("启动公众号/小程序 token cache...");
        caches.push(TokenCache::spawn(
            WxClient::default(),
            Auth::Mp { appid, secret },
        ));
    }
    if let (Ok(corp_id), Ok(corp_secret)) = (env::var("WX_CORP_ID"), env::var("WX_CORP_SECRET")) {
        println!("启动企业微信 token cache...");
        caches.push(TokenCache::spawn(
            WxClient::default(),
            Auth::Work {
                corp_id,
                corp_secret,
            },
        ));
    }

    if caches.is_empty() {
        println!("未配置任何凭据。请至少设置以下任一组环境变量：");
        println!("  - 公众号/小程序：WX_APPID, WX_SECRET");
        println!("  - 企业微信：WX_CORP_ID, WX_CORP_SECRET");
        return Ok(());
    }

    // 后台任务在 spawn 后立即拉取首个 token；轮询直到就绪。
    for cache in &caches {
        let mut last_err = None;
        for _ in 0..50 {
            match cache.token() {
                Ok(token) => {
                    println!(
                        "[OK] {} access_token 获取成功（长度 {}）",
                        cache.identity(),
                        token.len()
                    );
                    last_err = None;
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        if let Some(e) = last_err {
            eprintln!("[ERR] {} access_token 获取失败: {e}", cache.identity());
        }
    }

    Ok(())
}
