use teloxide::types::{KeyboardButton, KeyboardMarkup, KeyboardRemove, ReplyMarkup};

use crate::pipeline::types::{AspectRatio, PlacementMode, MAX_VARIANTS};

pub const START_BUTTON: &str = "START";
pub const CHEATSHEET_BUTTON: &str = "📓 Prompt cheat sheet";
pub const CUSTOM_STYLE_BUTTON: &str = "Custom scene (I'll describe it)";

pub const STYLE_PRESETS: [&str; 6] = [
    "Catalog: clean studio backdrop, soft shadow",
    "Minimalism: solid color, soft shadows",
    "Dark premium: low-key, rim light",
    "Marble/gloss: controlled highlights",
    "Nature: wood, linen, greenery, daylight",
    "Flat lay: top-down view, minimal props",
];

pub const WELCOME_TEXT: &str = "Hi! I turn a plain product photo into a styled product shot.\n\n\
I cut the product out, generate a new scene around it and send you the result as a file.\n\n\
Press START when you're ready.";

pub const PHOTO_REQUIREMENTS_TEXT: &str = "Send me a photo of the product.\n\n\
• one product, well lit, in focus\n\
• a plain background works best\n\
• send it as a file (document) to avoid Telegram compression\n\
• JPEG, PNG or WebP, at least 1 KB";

pub const HELP_TEXT: &str = "How it works:\n\
1. /start and press START\n\
2. send a product photo\n\
3. pick where the product goes, the aspect ratio and how many variants you want\n\
4. pick a scene style or describe your own\n\n\
Other commands:\n\
/cheatsheet - tips for writing scene descriptions\n\
/repeat - run your last request again\n\
/help - this message";

pub const CHEATSHEET_TEXT: &str = "📓 Scene prompt cheat sheet\n\n\
Describe the background, light and mood, not the product. Short English phrases work best.\n\n\
Light: studio soft light; hard sunlight with crisp shadows; golden hour; rim light\n\
Surfaces: glossy marble; raw concrete; light oak; linen cloth; wet stone\n\
Mood: dark premium look; airy minimal; cozy interior, warm sunlight; fresh and clean\n\
Composition: shallow depth of field; top-down flat lay; lots of empty space on the left\n\n\
Example: \"light oak table by a window, morning sun, soft shadows, blurred green plants\"";

/// Which reply keyboard accompanies a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyboard {
    Start,
    Placement,
    Aspect,
    Variants,
    Style,
    Remove,
}

pub fn keyboard_rows(keyboard: Keyboard) -> Vec<Vec<String>> {
    match keyboard {
        Keyboard::Start => vec![vec![START_BUTTON.to_string(), CHEATSHEET_BUTTON.to_string()]],
        Keyboard::Placement => PlacementMode::ALL
            .iter()
            .map(|mode| vec![mode.label().to_string()])
            .collect(),
        Keyboard::Aspect => {
            let labels: Vec<String> = AspectRatio::ALL.iter().map(|aspect| aspect.label().to_string()).collect();
            labels.chunks(3).map(|chunk| chunk.to_vec()).collect()
        }
        Keyboard::Variants => vec![(1..=MAX_VARIANTS).map(|count| count.to_string()).collect()],
        Keyboard::Style => STYLE_PRESETS
            .iter()
            .chain(std::iter::once(&CUSTOM_STYLE_BUTTON))
            .map(|label| vec![label.to_string()])
            .collect(),
        Keyboard::Remove => Vec::new(),
    }
}

pub fn reply_markup(keyboard: Keyboard) -> ReplyMarkup {
    if keyboard == Keyboard::Remove {
        return ReplyMarkup::KeyboardRemove(KeyboardRemove::new());
    }
    let rows = keyboard_rows(keyboard)
        .into_iter()
        .map(|row| row.into_iter().map(KeyboardButton::new).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    ReplyMarkup::Keyboard(KeyboardMarkup::new(rows).resize_keyboard())
}
