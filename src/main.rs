use std::sync::Arc;

use pingora::services::{background::background_service, listening::Service};
use pingora_core::server::{configuration::Opt, Server};
use pingora_proxy::http_proxy_service_with_name;

use pingroute::{
    config::{Config, HealthCheckMode},
    logging::{self, Logger},
    proxy::{backend::Registry, health_check::HealthMonitor},
    service::{http::build_http_service, status::StatusHttpApp},
};

const PINGROUTE_SERVICE: &str = "pingroute";

fn main() {
    let opt = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&opt) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let logger = match &config.log {
        Some(log_cfg) => {
            let logger = Logger::new(log_cfg.clone());
            logger.init_env_logger();
            Some(logger)
        }
        None => {
            logging::init_stderr_logger(log::LevelFilter::Info);
            None
        }
    };

    log::info!("Registering backends...");
    let registry = Arc::new(Registry::build(&config));
    let proxy_logic = build_http_service(&config, registry.clone());

    let mut server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        server.add_service(log_service);
    }

    if config.health_check.mode == HealthCheckMode::Background {
        log::info!("Adding health check service...");
        let monitor = HealthMonitor::from_config(registry.clone(), &config.health_check);
        server.add_service(background_service("health check", monitor));
    }

    if let Some(status_cfg) = &config.status {
        log::info!("Adding status service on {}...", status_cfg.address);
        server.add_service(StatusHttpApp::status_http_service(status_cfg, registry.clone()));
    }

    if let Some(prometheus_cfg) = &config.prometheus {
        log::info!("Adding prometheus service on {}...", prometheus_cfg.address);
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    let mut http_service =
        http_proxy_service_with_name(&server.configuration, proxy_logic, PINGROUTE_SERVICE);

    log::info!("Adding listeners...");
    for listener in &config.listeners {
        http_service.add_tcp(&listener.address.to_string());
    }

    log::info!("Bootstrapping...");
    server.bootstrap();
    log::info!("Bootstrapped. Adding Services...");
    server.add_service(http_service);

    log::info!("Starting Server...");
    server.run_forever();
}
