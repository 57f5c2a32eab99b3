//! 配置校验模块
//!
//! 校验规则：
//! - 至少配置一个设备
//! - 设备地址非空且唯一
//! - 骑行时长、连接超时 > 0
//! - 重连次数 >= 1，退避间隔 > 0
//! - 服务端口非 0
//! - 类型上声明的字段范围 (`validator` derive)

use std::collections::HashSet;

use contracts::{ContractError, RideBlueprint};
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// 校验 RideBlueprint，返回遇到的第一个错误
pub fn validate(blueprint: &RideBlueprint) -> Result<(), ContractError> {
    validate_devices(blueprint)?;
    validate_addresses(blueprint)?;
    validate_ride(blueprint)?;
    validate_reconnect(blueprint)?;
    validate_server(blueprint)?;
    blueprint.validate().map_err(|e| first_field_error("", &e))?;
    Ok(())
}

fn validate_devices(blueprint: &RideBlueprint) -> Result<(), ContractError> {
    if blueprint.devices.is_empty() {
        return Err(ContractError::config_validation(
            "devices",
            "at least one device is required",
        ));
    }
    Ok(())
}

/// 地址非空且唯一
fn validate_addresses(blueprint: &RideBlueprint) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for (idx, device) in blueprint.devices.iter().enumerate() {
        if device.address.is_blank() {
            return Err(ContractError::config_validation(
                format!("devices[{idx}].address"),
                "device address cannot be empty",
            ));
        }
        if !seen.insert(device.address.as_str()) {
            return Err(ContractError::config_validation(
                format!("devices[address={}]", device.address),
                "duplicate device address",
            ));
        }
    }
    Ok(())
}

fn validate_ride(blueprint: &RideBlueprint) -> Result<(), ContractError> {
    let ride = &blueprint.ride;
    if !(ride.duration_minutes.is_finite() && ride.duration_minutes > 0.0) {
        return Err(ContractError::config_validation(
            "ride.duration_minutes",
            format!("duration must be > 0, got {}", ride.duration_minutes),
        ));
    }
    if !(ride.connect_timeout_secs.is_finite() && ride.connect_timeout_secs > 0.0) {
        return Err(ContractError::config_validation(
            "ride.connect_timeout_secs",
            format!("connect timeout must be > 0, got {}", ride.connect_timeout_secs),
        ));
    }
    Ok(())
}

fn validate_reconnect(blueprint: &RideBlueprint) -> Result<(), ContractError> {
    let reconnect = &blueprint.reconnect;
    if reconnect.max_attempts == 0 {
        return Err(ContractError::config_validation(
            "reconnect.max_attempts",
            "max_attempts must be >= 1",
        ));
    }
    if !(reconnect.backoff_secs.is_finite() && reconnect.backoff_secs > 0.0) {
        return Err(ContractError::config_validation(
            "reconnect.backoff_secs",
            format!("backoff must be > 0, got {}", reconnect.backoff_secs),
        ));
    }
    Ok(())
}

fn validate_server(blueprint: &RideBlueprint) -> Result<(), ContractError> {
    if blueprint.server.port == 0 {
        return Err(ContractError::config_validation(
            "server.port",
            "port must be between 1 and 65535",
        ));
    }
    Ok(())
}

/// 将嵌套的 derive 校验错误展开为 `a.b[0].c` 形式的字段路径
fn first_field_error(prefix: &str, errors: &ValidationErrors) -> ContractError {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in fields {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                if let Some(error) = list.first() {
                    let message = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("failed '{}' check", error.code));
                    return ContractError::config_validation(path, message);
                }
            }
            ValidationErrorsKind::Struct(inner) => return first_field_error(&path, inner),
            ValidationErrorsKind::List(items) => {
                if let Some((idx, inner)) = items.iter().next() {
                    return first_field_error(&format!("{path}[{idx}]"), inner);
                }
            }
        }
    }
    ContractError::config_validation(prefix, errors.to_string())
}
