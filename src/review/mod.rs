//! The writeup review bot: applicants send a PDF, a reviewer picked in
//! rotation accepts, rejects or blocks them.

mod commands;
mod submission;

use std::sync::Arc;

use crate::dispatcher::{Handlers, Matcher};
use crate::event::ChatId;
use crate::outbound::InviteLinks;
use crate::storage::Store;

/// Session tag after `/start`.
pub const STARTED: &str = "STARTED";
/// Session tag while the applicant's writeup is with a reviewer.
pub const AWAITING_REVIEW: &str = "AWAITING_REVIEW";

pub(crate) mod texts {
    pub const WELCOME: &str = "👋 ¡Hola! Soy el bot de Hackiit.\n\n\
        Si te gustaría ser parte del grupo, envíame tu <b>writeup en formato PDF</b> para poder revisarlo. \
        En caso de ser aceptado, te añadiré al grupo.\n\n\
        Para acceder a la plataforma de retos de iniciación, regístrate en: https://retos.hackiit.org";

    pub const HELP: &str = "Comandos disponibles:\n\
        /start - iniciar\n\
        /userinfo - ver tu información de usuario\n\
        /reset - reiniciar la conversación\n\
        /help - ayuda\n\
        /unblock <user_id> - desbloquear usuario (solo revisores)";

    pub const RESET: &str = "🔄 Conversación reiniciada.";

    pub const BLOCKED: &str = "❌ Estás bloqueado y no puedes enviar writeups.";
    pub const PDF_ONLY: &str = "Solo se aceptan archivos PDF.";
    pub const NO_REVIEWERS: &str = "No hay revisores configurados. Inténtalo más tarde.";
    pub const SUBMITTED: &str = "✅ Tu writeup ha sido enviado a revisión.\n\n\
        Recibirás una respuesta cuando uno de nuestros revisores le eche un vistazo.";
    pub const SUBMIT_FAILED: &str = "Error al enviar el writeup a revisión.";

    pub const ALREADY_REVIEWED: &str = "❌ Este writeup ya ha sido revisado o no existe.";
    pub const ACCEPTED: &str = "🎉 ¡Tu writeup ha sido aceptado! Ya formas parte de Hackiit.";
    pub const REJECTED: &str =
        "❌ Tu writeup ha sido rechazado, pero puedes intentarlo de nuevo cuando quieras.";
    pub const BLOCKED_NOTICE: &str =
        "🚫 Has sido bloqueado y no podrás enviar writeups hasta que un administrador te desbloquee.";

    pub const STILL_PENDING: &str =
        "⏳ Tu writeup sigue en revisión. Te avisaré en cuanto haya una respuesta.";
    pub const ALREADY_DECIDED: &str =
        "Tu writeup ya ha sido revisado. Si quieres, puedes enviarme uno nuevo en PDF.";
    pub const HINT: &str = "Envíame tu writeup en formato PDF o usa /help para ver los comandos.";

    pub const UNBLOCK_FORBIDDEN: &str = "❌ No tienes permiso para desbloquear usuarios.";
    pub const UNBLOCK_USAGE: &str = "Uso: /unblock <user_id>";
    pub const UNBLOCK_NOT_NUMERIC: &str = "❌ El user_id debe ser un número.";
    pub const NOT_BLOCKED: &str = "❌ El usuario no estaba bloqueado.";
}

/// Handler registrations for the review bot, in match order.
pub fn handlers(store: Store, invites: Arc<dyn InviteLinks>, group_id: ChatId) -> Handlers {
    Handlers::new()
        .on("start", Matcher::command("start"), commands::Start)
        .on("help", Matcher::command("help"), commands::Help)
        .on("userinfo", Matcher::command("userinfo"), commands::UserInfo)
        .on("reset", Matcher::command("reset"), commands::Reset)
        .on(
            "unblock",
            Matcher::command("unblock"),
            commands::Unblock {
                store: store.clone(),
            },
        )
        .on(
            "submit",
            Matcher::document(),
            submission::SubmitDocument {
                store: store.clone(),
            },
        )
        .on(
            "decision",
            Matcher::callback(&["accept:", "reject:", "block:"]),
            submission::Decision {
                store: store.clone(),
                invites,
                group_id,
            },
        )
        .on(
            "pending-status",
            Matcher::text()
                .and(Matcher::private_chat())
                .and(Matcher::in_state(AWAITING_REVIEW)),
            commands::PendingStatus { store },
        )
        .on(
            "hint",
            Matcher::text().and(Matcher::private_chat()),
            commands::Hint,
        )
}
