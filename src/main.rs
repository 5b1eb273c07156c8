use evopell_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(err) = evopell_bridge::app(options).await {
        error!("{:?}", err);
        std::process::exit(255);
    }
}
