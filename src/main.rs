use clap::{crate_version, App, Arg};
use h2kit::{Client, Url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("h2kit")
        .version(crate_version!())
        .arg(Arg::with_name("url").required(true).index(1))
        .get_matches();
    let url = Url::parse(matches.value_of("url").expect("missing url"))?;

    let client = Client::default();
    match client.get(url).await {
        Ok(response) => println!("{}", response.text()),
        Err(err) => eprintln!("{err:#?}"),
    }
    Ok(())
}
