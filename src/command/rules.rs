use super::{ActionKind, CommandParameters, CommandRule, ExtractError, RuleMatch};

const PASSWORD_SLOT: &str = r"(?:contrasena|password|clave)";

/// The es-AR vocabulary. Priorities are part of the contract: fills outrank
/// everything, capture outranks navigation that shares keywords.
pub fn canonical_rules() -> Result<Vec<CommandRule>, regex::Error> {
    Ok(vec![
        CommandRule::pattern(
            "confirm-password",
            &format!(r"\brepetir\s+(?:la\s+)?{PASSWORD_SLOT}\s+(?P<value>.+)$"),
            ActionKind::FillConfirmPassword,
        )?
        .with_priority(100)
        .with_extractor(extract_secret)
        .described("repetir contraseña <clave>"),
        CommandRule::pattern(
            "confirm-password-written",
            &format!(
                r"\bescribir\s+(?P<value>.+?)\s+en\s+(?:repetir|confirmar)\s+(?:la\s+)?{PASSWORD_SLOT}\b"
            ),
            ActionKind::FillConfirmPassword,
        )?
        .with_priority(100)
        .with_extractor(extract_secret),
        CommandRule::pattern(
            "fill-email",
            r"\bescribir\s+(?P<value>.+?)\s+en\s+(?:el\s+)?(?:email|e-mail|correo|mail)\b",
            ActionKind::FillEmail,
        )?
        .with_priority(100)
        .with_extractor(extract_email)
        .described("escribir <correo> en email"),
        CommandRule::pattern(
            "fill-password",
            &format!(r"\bescribir\s+(?P<value>.+?)\s+en\s+(?:la\s+)?{PASSWORD_SLOT}\b"),
            ActionKind::FillPassword,
        )?
        .with_priority(100)
        .with_extractor(extract_password)
        .described("escribir <clave> en contraseña"),
        CommandRule::pattern(
            "stop-listening",
            r"\b(?:detener|desactivar)\s+(?:la\s+)?escucha\b|\bdejar\s+de\s+escuchar\b",
            ActionKind::StopListening,
        )?
        .with_priority(90)
        .described("detener escucha"),
        CommandRule::pattern(
            "end-session",
            r"\b(?:cerrar\s+(?:la\s+)?sesion|logout|salir)\b",
            ActionKind::EndSession,
        )?
        .with_priority(90)
        .requiring_confirmation()
        .described("cerrar sesión"),
        CommandRule::literal("help", "ayuda", ActionKind::ShowHelp)
            .with_priority(80)
            .described("ayuda"),
        CommandRule::pattern(
            "upload-image",
            r"\b(?:subir|cargar)\s+(?:una?\s+)?(?:imagen|archivo|foto)\b",
            ActionKind::UploadImage,
        )?
        .with_priority(60)
        .described("subir imagen"),
        CommandRule::pattern(
            "capture-photo",
            r"\b(?:capturar|captura|(?:tomar|sacar)\s+(?:una\s+)?foto|foto)\b",
            ActionKind::CapturePhoto,
        )?
        .with_priority(60)
        .described("capturar / tomar foto"),
        CommandRule::pattern(
            "pause-audio",
            r"\b(?:pausar|pausa|parar|stop|detener)\b",
            ActionKind::PauseAudio,
        )?
        .with_priority(50)
        .described("pausar audio"),
        CommandRule::literal("replay-audio", "repetir", ActionKind::ReplayAudio)
            .with_priority(50)
            .with_extractor(reject_password_slot)
            .described("repetir"),
        CommandRule::pattern(
            "play-audio",
            r"\b(?:reproducir|escuchar|play)\b",
            ActionKind::PlayAudio,
        )?
        .with_priority(50)
        .described("reproducir audio"),
        CommandRule::pattern(
            "clear-form",
            r"\b(?:limpiar|borrar|vaciar)\b",
            ActionKind::ClearForm,
        )?
        .with_priority(40)
        .with_extractor(reject_session_mention)
        .described("limpiar"),
        CommandRule::pattern(
            "submit-form",
            r"^(?:enviar|confirmar|aceptar|ok|ingresar|entrar)$",
            ActionKind::SubmitForm,
        )?
        .with_priority(40)
        .described("enviar / confirmar"),
        CommandRule::literal("submit-login", "iniciar sesion", ActionKind::SubmitLogin)
            .with_priority(40)
            .described("iniciar sesión"),
        CommandRule::literal("create-account", "crear cuenta", ActionKind::CreateAccount)
            .with_priority(40)
            .described("crear cuenta"),
        CommandRule::pattern(
            "navigate-camera",
            r"\bir\s+a\s+(?:la\s+)?(?:camara|vision)\b|^camara$",
            ActionKind::NavigateCamera,
        )?
        .with_priority(30)
        .described("ir a cámara"),
        CommandRule::pattern(
            "navigate-register",
            r"\b(?:ir\s+al?\s+registro|registrarse|registrarme|registro|registrar)\b",
            ActionKind::NavigateRegister,
        )?
        .with_priority(30)
        .described("ir a registro"),
        CommandRule::pattern(
            "navigate-login",
            r"\b(?:ir\s+al?\s+(?:login|inicio)|login|inicio|acceder|entrar)\b",
            ActionKind::NavigateLogin,
        )?
        .with_priority(30)
        .described("ir a login"),
    ])
}

/// Rewrites a dictated address: "juan arroba gmail punto com" -> "juan@gmail.com".
pub fn spoken_email(raw: &str) -> String {
    let tokens = raw.split_whitespace().collect::<Vec<_>>();
    let mut out = String::with_capacity(raw.len());
    let mut idx = 0usize;

    while idx < tokens.len() {
        match (tokens[idx], tokens.get(idx + 1).copied()) {
            ("guion", Some("bajo")) => {
                out.push('_');
                idx += 2;
                continue;
            }
            ("arroba", _) => out.push('@'),
            ("punto", _) => out.push('.'),
            ("guion", _) => out.push('-'),
            (token, _) => out.push_str(token),
        }
        idx += 1;
    }

    out.to_lowercase()
}

/// Secrets are dictated with pauses; the spaces are not part of the value.
pub fn compact_secret(raw: &str) -> String {
    raw.split_whitespace().collect()
}

fn text_parameter(value: String) -> Result<CommandParameters, ExtractError> {
    if value.is_empty() {
        return Err(ExtractError::EmptyValue);
    }
    Ok(CommandParameters::from([("text".to_string(), value)]))
}

fn extract_email(found: &RuleMatch<'_>) -> Result<CommandParameters, ExtractError> {
    text_parameter(spoken_email(found.group("value")?))
}

fn extract_secret(found: &RuleMatch<'_>) -> Result<CommandParameters, ExtractError> {
    text_parameter(compact_secret(found.group("value")?))
}

fn extract_password(found: &RuleMatch<'_>) -> Result<CommandParameters, ExtractError> {
    if found.text().contains("repetir") {
        return Err(ExtractError::Rejected("password repeat belongs to confirm-password"));
    }
    extract_secret(found)
}

fn reject_password_slot(found: &RuleMatch<'_>) -> Result<CommandParameters, ExtractError> {
    let text = found.text();
    if ["contrasena", "password", "clave"]
        .iter()
        .any(|slot| text.contains(slot))
    {
        return Err(ExtractError::Rejected("names a password slot"));
    }
    Ok(CommandParameters::new())
}

fn reject_session_mention(found: &RuleMatch<'_>) -> Result<CommandParameters, ExtractError> {
    if found.text().contains("sesion") {
        return Err(ExtractError::Rejected("mentions the session"));
    }
    Ok(CommandParameters::new())
}
