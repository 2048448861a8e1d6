fn main() {
    if let Err(err) = commerce_medallion::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
