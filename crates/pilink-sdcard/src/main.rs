//! spi_sd_card: answer one SPI storage request.
//!
//! Usage: `spi_sd_card ACTION [arg1] [arg2]`. Prints exactly one reply line.

use std::process;

use pilink::logging::init_tracing;
use pilink_sdcard::{Request, SdCard, reply_line};

fn main() {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();

    let Some((action, rest)) = args.split_first().filter(|(action, _)| !action.is_empty()) else {
        println!("Error: No action specified");
        process::exit(1);
    };

    let result = SdCard::from_env()
        .and_then(|card| Request::parse(action, rest).and_then(|request| card.execute(&request)));

    if let Err(e) = &result {
        tracing::debug!(error = %e, %action, "Request failed");
    }
    println!("{}", reply_line(&result));
}
