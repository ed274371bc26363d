//! Wording for push notifications. Pure functions so the text can be tested
//! with a seeded RNG.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::models::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub body: String,
}

fn pick<R: Rng + ?Sized>(rng: &mut R, options: &[String]) -> String {
    options.choose(rng).cloned().unwrap_or_default()
}

pub fn owner_morning<R: Rng + ?Sized>(rng: &mut R) -> Notice {
    let titles = [
        "☀️ Good morning!",
        "🚀 Ready for today's customers?",
        "📈 Start the day strong",
        "⏰ Fresh stock time",
    ]
    .map(String::from);
    let bodies = [
        "A new sales day is here. Review your inventory and add today's fresh items.",
        "Shoppers nearby are browsing. Make sure your best products are listed.",
        "Let's make today your best sales day yet.",
        "New products draw more views. What's fresh in your shop today?",
    ]
    .map(String::from);
    Notice { title: pick(rng, &titles), body: pick(rng, &bodies) }
}

pub fn owner_evening_stats<R: Rng + ?Sized>(rng: &mut R, today: u64, yesterday: u64) -> Notice {
    let options: Vec<String> = if today == 0 {
        vec![
            "A quiet day with no shop views. Tomorrow is a fresh chance!".into(),
            "No views today. A promotion could bring shoppers in tomorrow.".into(),
            "Zero views logged today. Time to plan for more visibility.".into(),
        ]
    } else if today > yesterday {
        let gain = today - yesterday;
        vec![
            format!("🚀 {today} views today, {gain} more than yesterday!"),
            format!("📈 Trending up with {today} views today. Keep it going!"),
            format!("🎉 {today} views today. Interest in your shop is growing!"),
        ]
    } else if today < yesterday {
        let drop = yesterday - today;
        vec![
            format!("👍 {today} views today. Let's aim higher tomorrow!"),
            format!("➡️ {today} views today. What could boost tomorrow?"),
            format!("📊 {today} views today, {drop} fewer than yesterday. Time to bounce back!"),
        ]
    } else {
        vec![
            format!("✨ {today} views again today. Nicely consistent!"),
            format!("✅ {today} views today, matching yesterday."),
            format!("➡️ Held steady at {today} views. Can we push it higher?"),
        ]
    };
    Notice { title: "📊 Today's shop performance".into(), body: pick(rng, &options) }
}

pub fn owner_night_stock<R: Rng + ?Sized>(rng: &mut R, low_stock: &[String]) -> Notice {
    let options: Vec<String> = if low_stock.is_empty() {
        vec![
            "Stock levels look healthy. Have a restful night!".into(),
            "Inventory looks ready for tomorrow.".into(),
            "Great work today. Rest up for more sales tomorrow!".into(),
        ]
    } else {
        let items = low_stock.join(", ");
        vec![
            format!("Before closing: you're running low on {items}. Time to restock?"),
            format!("Heads up! {items} may need replenishing soon."),
            format!("Stock alert: consider restocking {items} for tomorrow's customers."),
        ]
    };
    Notice { title: "🌙 Time for a stock check?".into(), body: pick(rng, &options) }
}

/// Up to three names, with "& more" when the list was longer.
pub fn sample_names(names: &[String]) -> String {
    let mut sample = names.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
    if names.len() > 3 {
        sample.push_str(" & more");
    }
    sample
}

pub fn customer_essentials(shop_name: &str, product_names: &[String]) -> Notice {
    Notice {
        title: format!("☀️ Fresh stock at {shop_name}!"),
        body: format!("Pick up fresh essentials like {} today!", sample_names(product_names)),
    }
}

pub fn customer_deals(shop_name: &str) -> Notice {
    Notice {
        title: "🔥 Deals near you".into(),
        body: format!("Special offers are live at {shop_name}. Open the app to grab them!"),
    }
}

pub fn subscription_reminder(days_left: i64, role: Role) -> Notice {
    let title = if days_left <= 1 { "❗ Final subscription reminder" } else { "⚠️ Subscription reminder" };
    let body = match role {
        Role::Customer => {
            format!("Your subscription expires in {days_left} day(s). Renew with coins to keep finding great deals!")
        }
        Role::Owner => format!("Your subscription expires in {days_left} day(s). Renew now to avoid interruption!"),
    };
    Notice { title: title.into(), body }
}

pub fn availability_request(product_name: &str) -> Notice {
    Notice { title: "Customer waiting! 🔔".into(), body: format!("Do you have {product_name} in stock?") }
}

pub fn missed_sale(product_name: &str) -> Notice {
    Notice {
        title: "⚠️ Missed sale alert".into(),
        body: format!("Someone nearby just searched for '{product_name}' but you have 0 in stock. Restock now?"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn evening_stats_reflect_trend() {
        let mut rng = StdRng::seed_from_u64(7);
        let up = owner_evening_stats(&mut rng, 12, 5);
        assert!(up.body.contains("12"));

        let none = owner_evening_stats(&mut rng, 0, 4);
        assert!(!none.body.chars().any(|c| c.is_ascii_digit()));

        for _ in 0..10 {
            let down = owner_evening_stats(&mut rng, 3, 9);
            assert!(down.body.starts_with("👍 3") || down.body.starts_with("➡️ 3") || down.body.contains("6 fewer"));
        }
    }

    #[test]
    fn night_stock_mentions_low_items() {
        let mut rng = StdRng::seed_from_u64(1);
        let names = vec!["Milk".to_string(), "Eggs".to_string()];
        assert!(owner_night_stock(&mut rng, &names).body.contains("Milk, Eggs"));
        assert!(!owner_night_stock(&mut rng, &[]).body.contains(','));
    }

    #[test]
    fn essentials_sample_three_names() {
        let names: Vec<String> = ["Milk", "Curd", "Apples", "Bananas"].map(String::from).to_vec();
        let copy = customer_essentials("Ravi Stores", &names);
        assert_eq!(copy.title, "☀️ Fresh stock at Ravi Stores!");
        assert!(copy.body.contains("Milk, Curd, Apples & more"));
        assert_eq!(sample_names(&names[..2]), "Milk, Curd");
    }

    #[test]
    fn subscription_reminder_wording_depends_on_role_and_urgency() {
        let last = subscription_reminder(1, Role::Owner);
        assert!(last.title.contains("Final"));
        assert!(last.body.contains("avoid interruption"));

        let early = subscription_reminder(10, Role::Customer);
        assert!(!early.title.contains("Final"));
        assert!(early.body.contains("coins"));
    }

    #[test]
    fn morning_copy_is_never_empty() {
        let mut rng = StdRng::seed_from_u64(42);
        let copy = owner_morning(&mut rng);
        assert!(!copy.title.is_empty() && !copy.body.is_empty());
    }
}
