fn main() {
    if let Err(error) = dashboard_stream_lib::run() {
        eprintln!("dashboard-stream: {error}");
        std::process::exit(1);
    }
}
