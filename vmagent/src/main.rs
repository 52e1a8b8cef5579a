fn main() {
    env_logger::init();
    vmagent::boot::early_init();
    let cfg = vmagent::config::Config::from_env();
    match vmagent::agent::Agent::new(cfg) {
        Ok(agent) => agent.run(),
        Err(e) => {
            log::error!("agent startup failed: {e}");
            unsafe {
                libc::sync();
                libc::reboot(libc::LINUX_REBOOT_CMD_POWER_OFF);
            }
            std::process::exit(1);
        }
    }
}
