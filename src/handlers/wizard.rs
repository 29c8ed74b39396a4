//! The per-chat conversation as an explicit state machine.
//!
//! Every step is a variant carrying exactly the choices made so far, and
//! [`advance`] is a pure function from (state, input) to the next state plus
//! whatever should be said and launched. Chat I/O lives in `commands`.

use std::sync::Arc;

use crate::handlers::keyboards::{
    Keyboard, CHEATSHEET_BUTTON, CHEATSHEET_TEXT, CUSTOM_STYLE_BUTTON, PHOTO_REQUIREMENTS_TEXT, START_BUTTON,
    WELCOME_TEXT,
};
use crate::pipeline::types::{AspectRatio, GenerationRequest, PlacementMode, VariantCount, MAX_VARIANTS};

#[derive(Debug, Clone)]
pub struct UploadedPhoto {
    pub file_id: String,
    pub bytes: Arc<Vec<u8>>,
}

/// Everything needed to run the pipeline once.
#[derive(Debug, Clone)]
pub struct Order {
    pub photo: UploadedPhoto,
    pub placement: PlacementMode,
    pub aspect: AspectRatio,
    pub variants: VariantCount,
    pub style: String,
}

impl Order {
    pub fn request(&self) -> GenerationRequest {
        GenerationRequest {
            source: self.photo.bytes.clone(),
            placement: self.placement,
            aspect: self.aspect,
            variants: self.variants,
            style: self.style.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum Session {
    #[default]
    AwaitingStart,
    AwaitingPhoto,
    AwaitingPlacement {
        photo: UploadedPhoto,
    },
    AwaitingAspect {
        photo: UploadedPhoto,
        placement: PlacementMode,
    },
    AwaitingVariants {
        photo: UploadedPhoto,
        placement: PlacementMode,
        aspect: AspectRatio,
    },
    AwaitingStyle {
        photo: UploadedPhoto,
        placement: PlacementMode,
        aspect: AspectRatio,
        variants: VariantCount,
    },
    AwaitingCustomStyle {
        photo: UploadedPhoto,
        placement: PlacementMode,
        aspect: AspectRatio,
        variants: VariantCount,
    },
    Generating {
        order: Order,
        token: u64,
    },
}

impl Session {
    pub fn step_name(&self) -> &'static str {
        match self {
            Session::AwaitingStart => "awaiting_start",
            Session::AwaitingPhoto => "awaiting_photo",
            Session::AwaitingPlacement { .. } => "awaiting_placement",
            Session::AwaitingAspect { .. } => "awaiting_aspect",
            Session::AwaitingVariants { .. } => "awaiting_variants",
            Session::AwaitingStyle { .. } => "awaiting_style",
            Session::AwaitingCustomStyle { .. } => "awaiting_custom_style",
            Session::Generating { .. } => "generating",
        }
    }

    pub fn is_generating(&self) -> bool {
        matches!(self, Session::Generating { .. })
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Delivered { count: u8 },
    /// `keep_order` is false when the photo itself was the problem.
    Failed { message: String, keep_order: bool },
}

#[derive(Debug, Clone)]
pub enum Input {
    /// `/start`: forget everything and greet.
    Start,
    Photo(UploadedPhoto),
    Text(String),
    /// Re-run a previously recorded order.
    Repeat(Order),
    Finished { token: u64, outcome: Outcome },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub keyboard: Keyboard,
}

impl Reply {
    fn new(text: impl Into<String>, keyboard: Keyboard) -> Self {
        Reply {
            text: text.into(),
            keyboard,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Launch {
    pub token: u64,
    pub order: Order,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub session: Session,
    pub reply: Option<Reply>,
    pub launch: Option<Launch>,
}

impl Transition {
    fn to(session: Session, reply: Reply) -> Self {
        Transition {
            session,
            reply: Some(reply),
            launch: None,
        }
    }

    fn silent(session: Session) -> Self {
        Transition {
            session,
            reply: None,
            launch: None,
        }
    }

    fn launch(order: Order, token: u64) -> Self {
        let reply = Reply::new(
            format!(
                "Working on {} variant(s): {} · {}. This usually takes a minute or two per variant.",
                order.variants.get(),
                order.placement.short_name(),
                order.aspect
            ),
            Keyboard::Remove,
        );
        Transition {
            session: Session::Generating {
                order: order.clone(),
                token,
            },
            reply: Some(reply),
            launch: Some(Launch { token, order }),
        }
    }
}

fn welcome() -> Reply {
    Reply::new(WELCOME_TEXT, Keyboard::Start)
}

fn ask_photo() -> Reply {
    Reply::new(PHOTO_REQUIREMENTS_TEXT, Keyboard::Remove)
}

fn ask_placement() -> Reply {
    Reply::new("Where should the product go?", Keyboard::Placement)
}

fn ask_aspect() -> Reply {
    Reply::new("Pick the aspect ratio of the final image.", Keyboard::Aspect)
}

fn ask_variants() -> Reply {
    Reply::new(
        format!("How many variants should I make? (1-{MAX_VARIANTS})"),
        Keyboard::Variants,
    )
}

fn ask_style() -> Reply {
    Reply::new(
        "Pick a scene style, or choose a custom scene and describe it in your own words.",
        Keyboard::Style,
    )
}

fn ask_custom_style() -> Reply {
    Reply::new(
        "Describe the scene: background, light and mood. Don't describe the product itself.",
        Keyboard::Remove,
    )
}

fn still_working() -> Reply {
    Reply::new(
        "I'm still working on your images. Send /start if you want to abandon this request.",
        Keyboard::Remove,
    )
}

fn style_from_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn advance(session: Session, input: Input, next_token: u64) -> Transition {
    match input {
        Input::Start => Transition::to(Session::AwaitingStart, welcome()),
        Input::Finished { token, outcome } => finish(session, token, outcome),
        Input::Repeat(order) => {
            if session.is_generating() {
                return Transition::to(session, still_working());
            }
            Transition::launch(order, next_token)
        }
        Input::Photo(photo) => {
            if session.is_generating() {
                return Transition::to(session, still_working());
            }
            Transition::to(Session::AwaitingPlacement { photo }, ask_placement())
        }
        Input::Text(text) => on_text(session, text, next_token),
    }
}

fn on_text(session: Session, text: String, next_token: u64) -> Transition {
    let choice = text.trim();
    match session {
        Session::AwaitingStart => match choice {
            START_BUTTON => Transition::to(Session::AwaitingPhoto, ask_photo()),
            CHEATSHEET_BUTTON => Transition::to(Session::AwaitingStart, Reply::new(CHEATSHEET_TEXT, Keyboard::Start)),
            _ => Transition::to(Session::AwaitingStart, welcome()),
        },
        Session::AwaitingPhoto => Transition::to(Session::AwaitingPhoto, ask_photo()),
        Session::AwaitingPlacement { photo } => match PlacementMode::from_label(choice) {
            Some(placement) => Transition::to(Session::AwaitingAspect { photo, placement }, ask_aspect()),
            None => Transition::to(Session::AwaitingPlacement { photo }, ask_placement()),
        },
        Session::AwaitingAspect { photo, placement } => match choice.parse::<AspectRatio>() {
            Ok(aspect) => Transition::to(
                Session::AwaitingVariants {
                    photo,
                    placement,
                    aspect,
                },
                ask_variants(),
            ),
            Err(_) => Transition::to(Session::AwaitingAspect { photo, placement }, ask_aspect()),
        },
        Session::AwaitingVariants {
            photo,
            placement,
            aspect,
        } => match choice.parse::<VariantCount>() {
            Ok(variants) => Transition::to(
                Session::AwaitingStyle {
                    photo,
                    placement,
                    aspect,
                    variants,
                },
                ask_style(),
            ),
            Err(_) => Transition::to(
                Session::AwaitingVariants {
                    photo,
                    placement,
                    aspect,
                },
                ask_variants(),
            ),
        },
        Session::AwaitingStyle {
            photo,
            placement,
            aspect,
            variants,
        } => {
            if choice == CUSTOM_STYLE_BUTTON {
                return Transition::to(
                    Session::AwaitingCustomStyle {
                        photo,
                        placement,
                        aspect,
                        variants,
                    },
                    ask_custom_style(),
                );
            }
            match style_from_text(choice) {
                Some(style) => Transition::launch(
                    Order {
                        photo,
                        placement,
                        aspect,
                        variants,
                        style,
                    },
                    next_token,
                ),
                None => Transition::to(
                    Session::AwaitingStyle {
                        photo,
                        placement,
                        aspect,
                        variants,
                    },
                    ask_style(),
                ),
            }
        }
        Session::AwaitingCustomStyle {
            photo,
            placement,
            aspect,
            variants,
        } => match style_from_text(choice).filter(|style| style != CUSTOM_STYLE_BUTTON) {
            Some(style) => Transition::launch(
                Order {
                    photo,
                    placement,
                    aspect,
                    variants,
                    style,
                },
                next_token,
            ),
            None => Transition::to(
                Session::AwaitingCustomStyle {
                    photo,
                    placement,
                    aspect,
                    variants,
                },
                ask_custom_style(),
            ),
        },
        generating @ Session::Generating { .. } => Transition::to(generating, still_working()),
    }
}

fn finish(session: Session, finished_token: u64, outcome: Outcome) -> Transition {
    let order = match session {
        Session::Generating { order, token } if token == finished_token => order,
        other => return Transition::silent(other),
    };

    match outcome {
        Outcome::Delivered { count } => Transition::to(
            Session::AwaitingStart,
            Reply::new(
                format!(
                    "Done! I sent {count} image(s). Press START for another product, or /repeat to run this request again."
                ),
                Keyboard::Start,
            ),
        ),
        Outcome::Failed { message, keep_order: true } => Transition::to(
            Session::AwaitingStyle {
                photo: order.photo,
                placement: order.placement,
                aspect: order.aspect,
                variants: order.variants,
            },
            Reply::new(message, Keyboard::Style),
        ),
        Outcome::Failed { message, keep_order: false } => {
            Transition::to(Session::AwaitingPhoto, Reply::new(message, Keyboard::Remove))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::keyboards::STYLE_PRESETS;

    fn photo() -> UploadedPhoto {
        UploadedPhoto {
            file_id: "photo-1".to_string(),
            bytes: Arc::new(vec![1, 2, 3]),
        }
    }

    fn text(value: &str) -> Input {
        Input::Text(value.to_string())
    }

    fn step(session: Session, input: Input) -> Transition {
        advance(session, input, 1)
    }

    fn at_style() -> Session {
        let mut session = Session::AwaitingStart;
        for input in [
            text(START_BUTTON),
            Input::Photo(photo()),
            text(PlacementMode::OnBody.label()),
            text("9:16"),
            text("2"),
        ] {
            session = step(session, input).session;
        }
        session
    }

    fn generating(token: u64) -> Session {
        advance(at_style(), text(STYLE_PRESETS[0]), token).session
    }

    #[test]
    fn walks_through_every_step_in_order() {
        let t = step(Session::AwaitingStart, Input::Start);
        assert_eq!(t.reply.map(|r| r.keyboard), Some(Keyboard::Start));

        let t = step(t.session, text(START_BUTTON));
        assert!(matches!(t.session, Session::AwaitingPhoto));

        let t = step(t.session, Input::Photo(photo()));
        assert!(matches!(t.session, Session::AwaitingPlacement { .. }));
        assert_eq!(t.reply.map(|r| r.keyboard), Some(Keyboard::Placement));

        let t = step(t.session, text(PlacementMode::InHand.label()));
        assert!(matches!(t.session, Session::AwaitingAspect { placement: PlacementMode::InHand, .. }));

        let t = step(t.session, text("4:5"));
        assert!(matches!(t.session, Session::AwaitingVariants { aspect: AspectRatio::Portrait4x5, .. }));

        let t = step(t.session, text("3"));
        assert!(matches!(t.session, Session::AwaitingStyle { .. }));

        let t = advance(t.session, text("  soft pastel gradient  "), 77);
        let launch = t.launch.expect("launch");
        assert_eq!(launch.token, 77);
        assert_eq!(launch.order.style, "soft pastel gradient");
        assert_eq!(launch.order.variants.get(), 3);
        assert_eq!(launch.order.photo.file_id, "photo-1");
        assert!(matches!(t.session, Session::Generating { token: 77, .. }));
    }

    #[test]
    fn unrecognized_choices_re_ask_without_losing_state() {
        let session = step(step(Session::AwaitingPhoto, Input::Photo(photo())).session, text("on the moon")).session;
        assert!(matches!(session, Session::AwaitingPlacement { .. }));

        let session = step(session, text(PlacementMode::Studio.label())).session;
        let t = step(session, text("2:3"));
        assert!(matches!(t.session, Session::AwaitingAspect { placement: PlacementMode::Studio, .. }));
        assert_eq!(t.reply.map(|r| r.keyboard), Some(Keyboard::Aspect));

        let session = step(t.session, text("1:1")).session;
        for bad in ["0", "6", "two"] {
            let t = step(session.clone(), text(bad));
            assert!(matches!(t.session, Session::AwaitingVariants { .. }));
            assert!(t.launch.is_none());
        }
    }

    #[test]
    fn custom_scene_asks_for_a_description_first() {
        let t = step(at_style(), text(CUSTOM_STYLE_BUTTON));
        assert!(matches!(t.session, Session::AwaitingCustomStyle { .. }));
        assert!(t.launch.is_none());

        let t = step(t.session, text("   "));
        assert!(matches!(t.session, Session::AwaitingCustomStyle { .. }));

        let t = step(t.session, text("neon city street at night"));
        assert_eq!(t.launch.map(|l| l.order.style), Some("neon city street at night".to_string()));
    }

    #[test]
    fn inputs_while_generating_get_a_still_working_reply() {
        for input in [text("hello"), Input::Photo(photo())] {
            let t = step(generating(5), input);
            assert!(matches!(t.session, Session::Generating { token: 5, .. }));
            assert!(t.launch.is_none());
            assert!(t.reply.expect("reply").text.contains("still working"));
        }
    }

    #[test]
    fn success_clears_the_session() {
        let t = step(
            generating(5),
            Input::Finished {
                token: 5,
                outcome: Outcome::Delivered { count: 2 },
            },
        );
        assert!(matches!(t.session, Session::AwaitingStart));
        assert!(t.reply.expect("reply").text.contains('2'));
    }

    #[test]
    fn failure_keeps_every_choice_for_a_retry() {
        let t = step(
            generating(5),
            Input::Finished {
                token: 5,
                outcome: Outcome::Failed {
                    message: "boom".to_string(),
                    keep_order: true,
                },
            },
        );
        match &t.session {
            Session::AwaitingStyle {
                photo,
                placement,
                aspect,
                variants,
            } => {
                assert_eq!(photo.file_id, "photo-1");
                assert_eq!(*placement, PlacementMode::OnBody);
                assert_eq!(*aspect, AspectRatio::Portrait9x16);
                assert_eq!(variants.get(), 2);
            }
            other => panic!("unexpected session {other:?}"),
        }
        assert_eq!(t.reply, Some(Reply::new("boom", Keyboard::Style)));

        let retry = advance(t.session, text(STYLE_PRESETS[2]), 6);
        assert_eq!(retry.launch.map(|l| l.token), Some(6));
    }

    #[test]
    fn bad_photo_failure_asks_for_a_new_photo() {
        let t = step(
            generating(5),
            Input::Finished {
                token: 5,
                outcome: Outcome::Failed {
                    message: "resend".to_string(),
                    keep_order: false,
                },
            },
        );
        assert!(matches!(t.session, Session::AwaitingPhoto));
    }

    #[test]
    fn start_abandons_a_running_request_and_its_result_is_ignored() {
        let t = step(generating(5), Input::Start);
        assert!(matches!(t.session, Session::AwaitingStart));

        let late = step(
            t.session,
            Input::Finished {
                token: 5,
                outcome: Outcome::Delivered { count: 1 },
            },
        );
        assert!(matches!(late.session, Session::AwaitingStart));
        assert!(late.reply.is_none());
    }

    #[test]
    fn stale_tokens_do_not_finish_a_newer_request() {
        let t = step(
            generating(9),
            Input::Finished {
                token: 8,
                outcome: Outcome::Failed {
                    message: "old".to_string(),
                    keep_order: true,
                },
            },
        );
        assert!(matches!(t.session, Session::Generating { token: 9, .. }));
        assert!(t.reply.is_none());
    }

    #[test]
    fn repeat_launches_unless_busy() {
        let order = match generating(1) {
            Session::Generating { order, .. } => order,
            other => panic!("unexpected session {other:?}"),
        };
        let t = advance(Session::AwaitingStart, Input::Repeat(order.clone()), 3);
        assert_eq!(t.launch.map(|l| l.token), Some(3));

        let busy = advance(generating(2), Input::Repeat(order), 4);
        assert!(busy.launch.is_none());
    }

    #[test]
    fn cheat_sheet_button_keeps_the_start_menu() {
        let t = step(Session::AwaitingStart, text(CHEATSHEET_BUTTON));
        assert!(matches!(t.session, Session::AwaitingStart));
        assert_eq!(t.reply.map(|r| r.text), Some(CHEATSHEET_TEXT.to_string()));
    }

    #[test]
    fn style_text_is_trimmed_and_kept_verbatim() {
        assert_eq!(style_from_text(&format!("  {}\n", STYLE_PRESETS[1])).as_deref(), Some(STYLE_PRESETS[1]));
        assert_eq!(style_from_text(" sunlit marble counter ").as_deref(), Some("sunlit marble counter"));
        assert_eq!(style_from_text(" \t\n"), None);
    }
}
