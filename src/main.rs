fn main() {
    if let Err(e) = netmeter_lib::run() {
        eprintln!("netmeter: {e:#}");
        std::process::exit(1);
    }
}
